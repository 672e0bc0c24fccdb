//! Host-side module loading for `import`.
//!
//! Paths resolve relative to a configured base directory and are
//! canonicalized before caching, so one file imported under different
//! spellings loads once. A stack of in-flight loads catches circular
//! imports. Imported modules run on the same VM and heap; their
//! top-level results are cached and rooted.

use crate::vm::heap::Handle;
use crate::vm::{StepResult, Vm};
use indexmap::IndexMap;
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Loader state held by the VM while imports are enabled.
pub(crate) struct Loader {
    base: PathBuf,
    cache: IndexMap<PathBuf, Handle>,
    loading: Vec<PathBuf>,
}

impl Loader {
    pub(crate) fn new(base: PathBuf) -> Self {
        Self {
            base,
            cache: IndexMap::new(),
            loading: Vec::new(),
        }
    }
}

impl Vm {
    /// The `import` opcode: resolve, consult the cache, detect cycles,
    /// otherwise compile and run the file.
    pub(crate) fn import_module(&mut self, path: &str) -> StepResult<Handle> {
        let Some(loader) = self.loader.as_mut() else {
            return self.raise("Imports are not enabled");
        };
        let resolved = loader.base.join(path);
        let canonical = match std::fs::canonicalize(&resolved) {
            Ok(canonical) => canonical,
            Err(e) => {
                let message = format!("Cannot import {:?}: {}", path, e);
                return self.raise(message);
            }
        };
        if let Some(&cached) = loader.cache.get(&canonical) {
            return Ok(cached);
        }
        if loader.loading.contains(&canonical) {
            let message = format!("Circular import of {:?}", path);
            return self.raise(message);
        }
        loader.loading.push(canonical.clone());

        let result = self.load_and_run(&canonical);

        if let Some(loader) = self.loader.as_mut() {
            loader.loading.pop();
        }
        let value = result?;
        if let Some(loader) = self.loader.as_mut() {
            loader.cache.insert(canonical, value);
        }
        self.roots.push(value);
        Ok(value)
    }

    fn load_and_run(&mut self, path: &Path) -> StepResult<Handle> {
        let source = match std::fs::read_to_string(path) {
            Ok(source) => source,
            Err(e) => {
                let message = format!("Cannot read {}: {}", path.display(), e);
                return self.raise(message);
            }
        };
        let module = match crate::compile_source(&path.display().to_string(), &source) {
            Ok(module) => module,
            Err(e) => {
                let message = format!("Import of {} failed: {}", path.display(), e);
                return self.raise(message);
            }
        };
        let module = Rc::new(module);
        let floor = self.frames.len();
        let globals = Rc::new(RefCell::new(vec![self.null; module.main.len()]));
        self.push_module_frame(module, globals);
        self.execute_until(floor)
    }
}

#[cfg(test)]
mod tests {
    use crate::bytecode::compiler;
    use crate::bytecode::Bytecode;
    use crate::lexer::Scanner;
    use crate::parser::Parser;
    use crate::vm::Vm;
    use std::path::PathBuf;
    use std::rc::Rc;

    fn compile(source: &str) -> Bytecode {
        let tokens = Scanner::new(source).scan_tokens().expect("scan failed");
        let program = Parser::new(tokens).parse().expect("parse failed");
        compiler::compile("<test>", source, &program).expect("compile failed")
    }

    fn run_with_base(source: &str, base: PathBuf) -> Result<String, String> {
        let mut vm = Vm::new();
        vm.enable_imports(base);
        let result = vm
            .run_module(Rc::new(compile(source)))
            .map_err(|e| e.to_string())?;
        Ok(vm.render_value(result))
    }

    #[test]
    fn test_import_and_cache() {
        let dir = std::env::temp_dir().join("oryx_import_test");
        std::fs::create_dir_all(&dir).expect("mkdir failed");
        std::fs::write(dir.join("util.ox"), "let table = {\"answer\": 42}\ntable")
            .expect("write failed");
        let source = "
let a = import \"util.ox\"
let b = import \"util.ox\"
(a[\"answer\"], a == b)";
        assert_eq!(run_with_base(source, dir).expect("run failed"), "(42, true)");
    }

    #[test]
    fn test_circular_import_raises() {
        let dir = std::env::temp_dir().join("oryx_circular_test");
        std::fs::create_dir_all(&dir).expect("mkdir failed");
        std::fs::write(dir.join("a.ox"), "import \"b.ox\"").expect("write failed");
        std::fs::write(dir.join("b.ox"), "import \"a.ox\"").expect("write failed");
        let err = run_with_base("import \"a.ox\"", dir).expect_err("must raise");
        assert!(err.contains("Circular import"));
    }

    #[test]
    fn test_missing_file_raises() {
        let dir = std::env::temp_dir().join("oryx_missing_import_test");
        std::fs::create_dir_all(&dir).expect("mkdir failed");
        let err = run_with_base("import \"nope.ox\"", dir).expect_err("must raise");
        assert!(err.contains("Cannot import"));
    }

    #[test]
    fn test_imports_disabled_raises() {
        let mut vm = Vm::new();
        let err = vm
            .run_module(Rc::new(compile("import \"anything.ox\"")))
            .expect_err("must raise");
        assert!(err.message.contains("not enabled"));
    }
}
