//! Source formatter: renders a parsed program back to canonical text.
//!
//! Backs `oryx fmt`. The renderer is not required to round-trip byte
//! for byte; it normalizes spacing and indentation.

use crate::ast::{
    BinaryOp, DeclKind, Expr, ExprKind, JumpKind, Literal, Pattern, Program, UnaryOp,
};
use std::fmt::Write;

/// Render a whole program.
pub fn format_program(program: &Program) -> String {
    let mut out = String::new();
    for stmt in &program.statements {
        render_expr(stmt, 0, &mut out);
        out.push('\n');
    }
    out
}

fn indent(depth: usize, out: &mut String) {
    for _ in 0..depth {
        out.push_str("    ");
    }
}

fn render_literal(lit: &Literal, out: &mut String) {
    match lit {
        Literal::Null => out.push_str("null"),
        Literal::Bool(b) => write!(out, "{}", b).unwrap(),
        Literal::Int(n) => write!(out, "{}", n).unwrap(),
        Literal::Num(n) => {
            if n.fract() == 0.0 && n.is_finite() {
                write!(out, "{:.1}", n).unwrap()
            } else {
                write!(out, "{}", n).unwrap()
            }
        }
        Literal::Str(s) => write!(out, "{:?}", s).unwrap(),
    }
}

fn binary_symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::DivFloor => "//",
        BinaryOp::Rem => "%",
        BinaryOp::Pow => "**",
        BinaryOp::Shl => "<<",
        BinaryOp::Shr => ">>",
        BinaryOp::BitAnd => "&",
        BinaryOp::BitOr => "|",
        BinaryOp::BitXor => "^",
        BinaryOp::Equal => "==",
        BinaryOp::NotEqual => "!=",
        BinaryOp::Less => "<",
        BinaryOp::LessEqual => "<=",
        BinaryOp::Greater => ">",
        BinaryOp::GreaterEqual => ">=",
        BinaryOp::In => "in",
        BinaryOp::And => "and",
        BinaryOp::Or => "or",
    }
}

fn render_pattern(pattern: &Pattern, out: &mut String) {
    match pattern {
        Pattern::Wildcard => out.push('_'),
        Pattern::Binding(name) => out.push_str(name),
        Pattern::Literal(lit) => render_literal(lit, out),
        Pattern::Tuple(elements) => {
            out.push('(');
            for (i, element) in elements.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                render_pattern(element, out);
            }
            out.push(')');
        }
        Pattern::List(elements) => {
            out.push('[');
            for (i, element) in elements.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                render_pattern(element, out);
            }
            out.push(']');
        }
        Pattern::Tagged { name, payload } => {
            out.push('.');
            out.push_str(name);
            if let Some(payload) = payload {
                out.push('(');
                render_pattern(payload, out);
                out.push(')');
            }
        }
        Pattern::Error(payload) => {
            out.push_str("error");
            if let Some(payload) = payload {
                out.push('(');
                render_pattern(payload, out);
                out.push(')');
            }
        }
    }
}

fn render_expr(expr: &Expr, depth: usize, out: &mut String) {
    match &expr.kind {
        ExprKind::Literal(lit) => render_literal(lit, out),
        ExprKind::Identifier(name) => out.push_str(name),
        ExprKind::Grouped(inner) => {
            out.push('(');
            render_expr(inner, depth, out);
            out.push(')');
        }
        ExprKind::Block(statements) => {
            if statements.is_empty() {
                out.push_str("{ }");
                return;
            }
            out.push_str("{\n");
            for stmt in statements {
                indent(depth + 1, out);
                render_expr(stmt, depth + 1, out);
                out.push('\n');
            }
            indent(depth, out);
            out.push('}');
        }
        ExprKind::Prefix { op, operand } => {
            out.push_str(match op {
                UnaryOp::Negate => "-",
                UnaryOp::Not => "!",
                UnaryOp::BitNot => "~",
            });
            render_expr(operand, depth, out);
        }
        ExprKind::Infix { op, lhs, rhs } => {
            render_expr(lhs, depth, out);
            write!(out, " {} ", binary_symbol(*op)).unwrap();
            render_expr(rhs, depth, out);
        }
        ExprKind::TypeInfix {
            is_cast,
            operand,
            ty,
        } => {
            render_expr(operand, depth, out);
            write!(out, " {} {}", if *is_cast { "as" } else { "is" }, ty.name()).unwrap();
        }
        ExprKind::Decl {
            kind,
            pattern,
            value,
        } => {
            out.push_str(match kind {
                DeclKind::Let => "let ",
                DeclKind::Const => "const ",
            });
            render_pattern(pattern, out);
            out.push_str(" = ");
            render_expr(value, depth, out);
        }
        ExprKind::Assign { target, op, value } => {
            render_expr(target, depth, out);
            match op {
                Some(op) => write!(out, " {}= ", binary_symbol(*op)).unwrap(),
                None => out.push_str(" = "),
            }
            render_expr(value, depth, out);
        }
        ExprKind::If { cond, then, els } => {
            out.push_str("if ");
            render_expr(cond, depth, out);
            out.push(' ');
            render_expr(then, depth, out);
            if let Some(els) = els {
                out.push_str(" else ");
                render_expr(els, depth, out);
            }
        }
        ExprKind::While { cond, body } => {
            out.push_str("while ");
            render_expr(cond, depth, out);
            out.push(' ');
            render_expr(body, depth, out);
        }
        ExprKind::For {
            binding,
            iterable,
            body,
        } => {
            write!(out, "for {} in ", binding).unwrap();
            render_expr(iterable, depth, out);
            out.push(' ');
            render_expr(body, depth, out);
        }
        ExprKind::Jump(kind) => match kind {
            JumpKind::Break => out.push_str("break"),
            JumpKind::Continue => out.push_str("continue"),
            JumpKind::Return(None) => out.push_str("return"),
            JumpKind::Return(Some(value)) => {
                out.push_str("return ");
                render_expr(value, depth, out);
            }
        },
        ExprKind::Tuple(elements) => {
            out.push('(');
            for (i, element) in elements.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                render_expr(element, depth, out);
            }
            if elements.len() == 1 {
                out.push(',');
            }
            out.push(')');
        }
        ExprKind::List(elements) => {
            out.push('[');
            for (i, element) in elements.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                render_expr(element, depth, out);
            }
            out.push(']');
        }
        ExprKind::Map(pairs) => {
            out.push('{');
            for (i, (key, value)) in pairs.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                render_expr(key, depth, out);
                out.push_str(": ");
                render_expr(value, depth, out);
            }
            out.push('}');
        }
        ExprKind::Range { start, end, step } => {
            render_expr(start, depth, out);
            out.push(':');
            render_expr(end, depth, out);
            if let Some(step) = step {
                out.push(':');
                render_expr(step, depth, out);
            }
        }
        ExprKind::Discard => out.push('_'),
        ExprKind::Fn { params, body } => {
            out.push_str("fn(");
            out.push_str(&params.join(", "));
            out.push_str(") ");
            render_expr(body, depth, out);
        }
        ExprKind::Call { callee, args } => {
            render_expr(callee, depth, out);
            out.push('(');
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                render_expr(arg, depth, out);
            }
            out.push(')');
        }
        ExprKind::MethodCall { recv, name, args } => {
            render_expr(recv, depth, out);
            write!(out, ".{}(", name).unwrap();
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                render_expr(arg, depth, out);
            }
            out.push(')');
        }
        ExprKind::Index {
            recv,
            index,
            or_null,
        } => {
            render_expr(recv, depth, out);
            out.push('[');
            render_expr(index, depth, out);
            out.push(']');
            if *or_null {
                out.push('?');
            }
        }
        ExprKind::ErrorLit(payload) => {
            out.push_str("error");
            if let Some(payload) = payload {
                out.push('(');
                render_expr(payload, depth, out);
                out.push(')');
            }
        }
        ExprKind::Tagged { name, payload } => {
            out.push('.');
            out.push_str(name);
            if let Some(payload) = payload {
                out.push('(');
                render_expr(payload, depth, out);
                out.push(')');
            }
        }
        ExprKind::Try { expr, catch } => {
            out.push_str("try ");
            render_expr(expr, depth, out);
            if let Some(clause) = catch {
                out.push_str(" catch ");
                if let Some(binding) = &clause.binding {
                    write!(out, "|{}| ", binding).unwrap();
                }
                render_expr(&clause.handler, depth, out);
            }
        }
        ExprKind::Import(path) => write!(out, "import {:?}", path).unwrap(),
        ExprKind::Native(name) => write!(out, "@{}", name).unwrap(),
        ExprKind::This => out.push_str("this"),
        ExprKind::Match { subject, cases } => {
            out.push_str("match ");
            render_expr(subject, depth, out);
            out.push_str(" {\n");
            for case in cases {
                indent(depth + 1, out);
                render_pattern(&case.pattern, out);
                out.push_str(" => ");
                render_expr(&case.body, depth + 1, out);
                out.push_str(",\n");
            }
            indent(depth, out);
            out.push('}');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Scanner;
    use crate::parser::Parser;

    fn fmt(source: &str) -> String {
        let tokens = Scanner::new(source).scan_tokens().expect("scan failed");
        let program = Parser::new(tokens).parse().expect("parse failed");
        format_program(&program)
    }

    #[test]
    fn test_format_normalizes_spacing() {
        assert_eq!(fmt("let x=1+2*3"), "let x = 1 + 2 * 3\n");
    }

    #[test]
    fn test_format_is_stable() {
        let sources = [
            "let f = fn(a, b) a + b\nf(40, 2)\n",
            "let acc = []\nfor x in 1:4 acc.append(x)\n",
            "let r = try 10 / 0 catch |e| e\nr is error\n",
            "let (a, _, b) = (1, 2, 3)\n",
        ];
        for source in sources {
            let once = fmt(source);
            let twice = fmt(&once);
            assert_eq!(once, twice, "formatting must be idempotent");
        }
    }

    #[test]
    fn test_format_match_and_blocks() {
        let out = fmt("match x { 1 => \"one\", _ => { let y = 2\ny } }");
        assert!(out.contains("match x {"));
        assert!(out.contains("1 => \"one\","));
        assert!(out.contains("let y = 2"));
    }
}
