//! End-to-end: compile a checked tree, assemble it, run the bytes on
//! the reference simulator, and check memory. Every scenario runs at
//! -O0 through -O3, so the optimizer has to preserve semantics to pass.

use yare::parameterized;

use sixtyc::{
    ArrayDecl, BinOp, BoolExpr, CmpOp, CompilationOptions, Compiler, CpuFeature, Expr,
    FunctionDef, GlobalDecl, LValue, LocalDecl, Platform, Program, Simulator, Statement, Type,
};

const OUTPUT: u16 = 0xc000;

fn byte_var(name: &str) -> GlobalDecl {
    GlobalDecl {
        name: name.to_string(),
        ty: Type::Byte,
        address: None,
        zero_page: true,
    }
}

fn program(functions: Vec<FunctionDef>) -> Program {
    Program {
        variables: vec![byte_var("a"), byte_var("b")],
        arrays: vec![ArrayDecl {
            name: "output".to_string(),
            length: Some(256),
            address: Some(OUTPUT),
        }],
        functions,
    }
}

fn assign(name: &str, value: Expr) -> Statement {
    Statement::Assign(LValue::Variable(name.to_string()), value)
}

fn compile(program: &Program, options: CompilationOptions) -> (Simulator, Vec<String>) {
    let platform = Platform::simulator();
    let features = options.features;
    let compiler = Compiler::new(platform.clone(), options);
    let output = compiler.compile(program).expect("compilation failed");

    let mut simulator = Simulator::new(features);
    let bank = platform.bank("default").unwrap();
    simulator.load(bank.start, &output.code["default"]);
    let entry = output
        .labels
        .iter()
        .find(|(name, _)| name == "main")
        .expect("no main label")
        .1;
    simulator
        .run_subroutine(entry, 1_000_000)
        .expect("program did not finish");
    (simulator, output.asm)
}

fn run_at_level(program: &Program, level: u8) -> Simulator {
    compile(program, CompilationOptions::default().with_level(level)).0
}

#[parameterized(o0 = { 0 }, o1 = { 1 }, o2 = { 2 }, o3 = { 3 })]
fn complex_expression(level: u8) {
    // output = (one() + one()) | ((one() << 2 - 1) ^ one())
    let expression = Expr::binary(
        BinOp::Or,
        Expr::binary(BinOp::Add, Expr::call("one", vec![]), Expr::call("one", vec![])),
        Expr::binary(
            BinOp::Xor,
            Expr::binary(
                BinOp::Sub,
                Expr::binary(BinOp::Shl, Expr::call("one", vec![]), Expr::num(2)),
                Expr::num(1),
            ),
            Expr::call("one", vec![]),
        ),
    );
    let program = program(vec![
        FunctionDef::new("main", vec![assign("output", expression)]),
        FunctionDef::new("one", vec![Statement::Return(Some(Expr::num(1)))])
            .returning(Type::Byte),
    ]);
    let simulator = run_at_level(&program, level);
    assert_eq!(simulator.read(OUTPUT), 2);
}

#[parameterized(o0 = { 0 }, o1 = { 1 }, o2 = { 2 }, o3 = { 3 })]
fn simple_addition(level: u8) {
    let program = program(vec![FunctionDef::new(
        "main",
        vec![
            assign("a", Expr::num(1)),
            assign(
                "output",
                Expr::binary(BinOp::Add, Expr::var("a"), Expr::var("a")),
            ),
        ],
    )]);
    let simulator = run_at_level(&program, level);
    assert_eq!(simulator.read(OUTPUT), 2);
}

#[parameterized(o0 = { 0 }, o1 = { 1 }, o2 = { 2 }, o3 = { 3 })]
fn immediate_addition(level: u8) {
    let program = program(vec![FunctionDef::new(
        "main",
        vec![
            assign("a", Expr::num(1)),
            assign(
                "output",
                Expr::binary(BinOp::Add, Expr::var("a"), Expr::num(65)),
            ),
        ],
    )]);
    let simulator = run_at_level(&program, level);
    assert_eq!(simulator.read(OUTPUT), 66);
}

#[parameterized(o0 = { 0 }, o1 = { 1 }, o2 = { 2 }, o3 = { 3 })]
fn in_place_indexed_addition(level: u8) {
    let indexed = LValue::Indexed {
        array: "output".to_string(),
        index: Expr::var("a"),
    };
    let program = program(vec![FunctionDef::new(
        "main",
        vec![
            Statement::Assign(
                LValue::Indexed {
                    array: "output".to_string(),
                    index: Expr::num(1),
                },
                Expr::num(5),
            ),
            assign("a", Expr::num(1)),
            Statement::CompoundAssign(indexed.clone(), BinOp::Add, Expr::num(1)),
            Statement::CompoundAssign(indexed, BinOp::Add, Expr::num(36)),
        ],
    )]);
    let simulator = run_at_level(&program, level);
    assert_eq!(simulator.read(OUTPUT + 1), 42);
}

#[parameterized(o0 = { 0 }, o1 = { 1 }, o2 = { 2 }, o3 = { 3 })]
fn byte_multiplication(level: u8) {
    let program = program(vec![FunctionDef::new(
        "main",
        vec![
            assign("a", Expr::num(7)),
            assign(
                "output",
                Expr::binary(BinOp::Mul, Expr::var("a"), Expr::num(2)),
            ),
        ],
    )]);
    let simulator = run_at_level(&program, level);
    assert_eq!(simulator.read(OUTPUT), 14);
}

#[parameterized(o0 = { 0 }, o1 = { 1 }, o2 = { 2 }, o3 = { 3 })]
fn byte_multiplication_table(level: u8) {
    for x in [0u8, 1, 2, 5, 7, 100] {
        for y in [0u8, 2, 4, 5, 54, 100] {
            let program = program(vec![FunctionDef::new(
                "main",
                vec![
                    assign("a", Expr::num(i64::from(x))),
                    assign("b", Expr::num(i64::from(y))),
                    assign(
                        "output",
                        Expr::binary(BinOp::Mul, Expr::var("a"), Expr::var("b")),
                    ),
                ],
            )]);
            let simulator = run_at_level(&program, level);
            assert_eq!(
                simulator.read(OUTPUT),
                x.wrapping_mul(y),
                "{} * {} at -O{}",
                x,
                y,
                level
            );
        }
    }
}

#[parameterized(o0 = { 0 }, o1 = { 1 }, o2 = { 2 }, o3 = { 3 })]
fn in_place_multiplication(level: u8) {
    let program = program(vec![FunctionDef::new(
        "main",
        vec![
            assign("output", Expr::num(54)),
            Statement::CompoundAssign(
                LValue::Variable("output".to_string()),
                BinOp::Mul,
                Expr::num(4),
            ),
        ],
    )]);
    let simulator = run_at_level(&program, level);
    assert_eq!(simulator.read(OUTPUT), 216);
}

#[test]
fn the_superoptimizer_preserves_semantics() {
    let program = program(vec![FunctionDef::new(
        "main",
        vec![
            assign("a", Expr::num(1)),
            assign(
                "output",
                Expr::binary(BinOp::Add, Expr::var("a"), Expr::num(65)),
            ),
        ],
    )]);
    let simulator = run_at_level(&program, 9);
    assert_eq!(simulator.read(OUTPUT), 66);
}

#[parameterized(o0 = { 0 }, o2 = { 2 })]
fn decimal_addition_in_bcd(level: u8) {
    let program = program(vec![FunctionDef::new(
        "main",
        vec![
            assign("a", Expr::num(0x19)),
            assign(
                "output",
                Expr::binary(BinOp::DecimalAdd, Expr::var("a"), Expr::num(0x03)),
            ),
        ],
    )]);
    let simulator = run_at_level(&program, level);
    assert_eq!(simulator.read(OUTPUT), 0x22);
}

#[parameterized(o0 = { 0 }, o2 = { 2 })]
fn while_loops_count(level: u8) {
    // a = 0; while a < 10 { a += 1 }; output = a
    let program = program(vec![FunctionDef::new(
        "main",
        vec![
            assign("a", Expr::num(0)),
            Statement::While {
                label: None,
                condition: BoolExpr::cmp(CmpOp::Lt, Expr::var("a"), Expr::num(10)),
                body: vec![Statement::CompoundAssign(
                    LValue::Variable("a".to_string()),
                    BinOp::Add,
                    Expr::num(1),
                )],
            },
            assign("output", Expr::var("a")),
        ],
    )]);
    let simulator = run_at_level(&program, level);
    assert_eq!(simulator.read(OUTPUT), 10);
}

#[parameterized(o0 = { 0 }, o2 = { 2 })]
fn for_loops_sum(level: u8) {
    // b = 0; for a = 1 to 5 { b += a }; output = b
    let program = program(vec![FunctionDef::new(
        "main",
        vec![
            assign("b", Expr::num(0)),
            Statement::For {
                label: None,
                variable: "a".to_string(),
                start: Expr::num(1),
                direction: sixtyc::ForDirection::To,
                end: Expr::num(5),
                body: vec![Statement::CompoundAssign(
                    LValue::Variable("b".to_string()),
                    BinOp::Add,
                    Expr::var("a"),
                )],
            },
            assign("output", Expr::var("b")),
        ],
    )]);
    let simulator = run_at_level(&program, level);
    assert_eq!(simulator.read(OUTPUT), 15);
}

#[parameterized(o0 = { 0 }, o2 = { 2 })]
fn long_then_branches_get_relaxed(level: u8) {
    // The then-branch is far longer than a short branch can skip.
    let padding = vec![sixtyc::AssemblyLine::implied(sixtyc::Opcode::NOP); 150];
    let build = |a: i64| {
        program(vec![FunctionDef::new(
            "main",
            vec![
                assign("a", Expr::num(a)),
                assign("output", Expr::num(0)),
                Statement::If {
                    condition: BoolExpr::cmp(CmpOp::Eq, Expr::var("a"), Expr::num(1)),
                    then_branch: vec![
                        Statement::InlineAssembly(padding.clone()),
                        assign("output", Expr::num(1)),
                    ],
                    else_branch: vec![],
                },
            ],
        )])
    };
    let taken = run_at_level(&build(1), level);
    assert_eq!(taken.read(OUTPUT), 1);
    let skipped = run_at_level(&build(2), level);
    assert_eq!(skipped.read(OUTPUT), 0);
}

fn stack_frame_program(locals: u8) -> Program {
    let declarations = (0..locals)
        .map(|i| LocalDecl {
            name: format!("s{}", i),
            ty: Type::Byte,
            on_stack: true,
        })
        .collect();
    program(vec![FunctionDef::new(
        "main",
        vec![
            assign("s0", Expr::num(11)),
            Statement::Assign(
                LValue::Variable(format!("s{}", locals - 1)),
                Expr::num(31),
            ),
            assign(
                "output",
                Expr::binary(
                    BinOp::Add,
                    Expr::var("s0"),
                    Expr::Variable(format!("s{}", locals - 1)),
                ),
            ),
        ],
    )
    .with_locals(declarations)])
}

#[parameterized(four = { 4 }, five = { 5 }, six = { 6 })]
fn stack_locals_work_at_any_frame_size(locals: u8) {
    for illegals in [false, true] {
        let mut options = CompilationOptions::default().with_level(2);
        if illegals {
            options = options.with_features(CpuFeature::ILLEGALS);
        }
        let (simulator, asm) = compile(&stack_frame_program(locals), options);
        assert_eq!(simulator.read(OUTPUT), 42, "locals={}", locals);

        // The SBX-based prologue switches on at exactly five bytes, and
        // only with the undocumented opcodes enabled.
        let uses_sbx = asm.iter().any(|line| line.contains("SBX"));
        assert_eq!(uses_sbx, illegals && locals > 4);
    }
}

#[test]
fn bounds_checking_traps_bad_indices() {
    let mut base = program(vec![]);
    base.arrays.push(ArrayDecl {
        name: "small".to_string(),
        length: Some(4),
        address: None,
    });

    let build = |index: i64| {
        let mut program = base.clone();
        program.functions = vec![FunctionDef::new(
            "main",
            vec![
                Statement::Assign(
                    LValue::Indexed {
                        array: "small".to_string(),
                        index: Expr::num(2),
                    },
                    Expr::num(9),
                ),
                assign("a", Expr::num(index)),
                assign("output", Expr::index("small", Expr::var("a"))),
            ],
        )];
        program
    };

    let mut options = CompilationOptions::default().with_level(2);
    options.check_array_bounds = true;

    let platform = Platform::simulator();
    let compiler = Compiler::new(platform.clone(), options.clone());

    // In range: the value comes through.
    let output = compiler.compile(&build(2)).unwrap();
    let mut simulator = Simulator::new(options.features);
    simulator.load(platform.bank("default").unwrap().start, &output.code["default"]);
    let entry = output.labels.iter().find(|(n, _)| n == "main").unwrap().1;
    simulator.run_subroutine(entry, 100_000).unwrap();
    assert_eq!(simulator.read(OUTPUT), 9);

    // Out of range: the program spins in the bounds trap and never
    // returns.
    let output = compiler.compile(&build(10)).unwrap();
    let mut simulator = Simulator::new(options.features);
    simulator.load(platform.bank("default").unwrap().start, &output.code["default"]);
    let entry = output.labels.iter().find(|(n, _)| n == "main").unwrap().1;
    assert!(simulator.run_subroutine(entry, 10_000).is_err());
}

#[test]
fn interrupt_functions_save_state_and_return_with_rti() {
    let handlers = program(vec![
        FunctionDef::new("main", vec![assign("output", Expr::num(1))]),
        FunctionDef::new("irq", vec![assign("a", Expr::num(1))]).as_interrupt(),
    ]);
    let compiler = Compiler::new(
        Platform::simulator(),
        CompilationOptions::default().with_level(2),
    );
    let output = compiler.compile(&handlers).unwrap();
    let irq_start = output.asm.iter().position(|l| l == "irq:").unwrap();
    assert_eq!(output.asm[irq_start + 1].trim(), "PHA");
    assert!(output.asm[irq_start..].iter().any(|l| l.trim() == "CLD"));
    assert!(output.asm[irq_start..].iter().any(|l| l.trim() == "RTI"));
}

#[test]
fn word_variables_store_both_bytes() {
    let mut base = program(vec![FunctionDef::new(
        "main",
        vec![
            Statement::Assign(LValue::Variable("w".to_string()), Expr::num(0x1234)),
            assign("output", Expr::num(1)),
        ],
    )]);
    base.variables.push(GlobalDecl {
        name: "w".to_string(),
        ty: Type::Word,
        address: None,
        zero_page: true,
    });

    let platform = Platform::simulator();
    let options = CompilationOptions::default().with_level(2);
    let compiler = Compiler::new(platform.clone(), options.clone());
    let output = compiler.compile(&base).unwrap();
    let address = output.labels.iter().find(|(n, _)| n == "w").unwrap().1;

    let mut simulator = Simulator::new(options.features);
    simulator.load(platform.bank("default").unwrap().start, &output.code["default"]);
    let entry = output.labels.iter().find(|(n, _)| n == "main").unwrap().1;
    simulator.run_subroutine(entry, 100_000).unwrap();
    assert_eq!(simulator.read(address), 0x34);
    assert_eq!(simulator.read(address + 1), 0x12);
}
