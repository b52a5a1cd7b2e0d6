use std::fs;

use anyhow::Context;
use sixtyc::{
    ArrayDecl, BinOp, CompilationOptions, Compiler, Expr, FunctionDef, GlobalDecl, LValue,
    Platform, Program, Statement, Type,
};

/// A little demo program: `a = 7; output = a * 6`, written against the
/// flat simulator platform. The real front end (parser, resolver, CLI)
/// lives upstream and hands the library a checked tree like this one.
fn demo_program() -> Program {
    Program {
        variables: vec![GlobalDecl {
            name: "a".to_string(),
            ty: Type::Byte,
            address: None,
            zero_page: true,
        }],
        arrays: vec![ArrayDecl {
            name: "output".to_string(),
            length: Some(256),
            address: Some(0xc000),
        }],
        functions: vec![FunctionDef::new(
            "main",
            vec![
                Statement::Assign(LValue::Variable("a".to_string()), Expr::num(7)),
                Statement::Assign(
                    LValue::Variable("output".to_string()),
                    Expr::binary(BinOp::Mul, Expr::var("a"), Expr::num(6)),
                ),
            ],
        )],
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let stem = std::env::args().nth(1).unwrap_or_else(|| "demo".to_string());

    let platform = Platform::simulator();
    let options = CompilationOptions::default().with_level(2);
    let compiler = Compiler::new(platform, options);
    let output = compiler.compile(&demo_program())?;

    for line in &output.asm {
        println!("{}", line);
    }

    let image_path = format!("{}.{}", stem, compiler.platform().output_extension);
    let image = output
        .code
        .values()
        .next()
        .context("no code banks were emitted")?;
    fs::write(&image_path, image).with_context(|| format!("writing {}", image_path))?;

    let label_path = format!("{}.lbl", stem);
    fs::write(&label_path, sixtyc::format_label_file(&output.labels))
        .with_context(|| format!("writing {}", label_path))?;

    println!("wrote {} and {}", image_path, label_path);
    Ok(())
}
