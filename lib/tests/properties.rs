mod support;

use classpatch::jvm::class_file::{ClassFile, Version};
use classpatch::jvm::code::{
    BranchInstruction, Instruction, InvokeType, MethodBody, MethodShape, OrdComparison,
};
use classpatch::patch::envelope;
use classpatch::patch::script::{Cond, Expr, Stmt};
use classpatch::patch::{
    Fallback, Guard, LogCall, PatchError, PatchStrategy, PrologueGuard, Replacement, WrapGuard,
};
use classpatch::pipeline::{Error, PatchRule, RuleOutcome, Settings, Transformer};
use support::interpreter::{run, Host, Outcome, Value};
use support::{method_body, method_code, Fixture, XorShift, STATIC};

const CLASS: &str = "com/example/Subject";

fn rule(target: &str, strategy: impl Into<PatchStrategy>, priority: i32) -> PatchRule {
    PatchRule::new(
        format!("test rule for {}", target),
        format!("{}.{}", CLASS, target).parse().unwrap(),
        strategy,
        priority,
    )
}

fn transformer(rules: Vec<PatchRule>) -> Transformer {
    Transformer::new(rules, Settings::default())
}

fn returned_int(outcome: Outcome) -> i32 {
    match outcome {
        Outcome::Returned(Some(Value::Int(int))) => int,
        other => panic!("expected an int, got {:?}", other),
    }
}

/// `static int twice(int)` and `static long twice(long)`
fn overloads() -> Fixture {
    let mut fixture = Fixture::new(CLASS);
    fixture
        .method(STATIC, "twice", "(I)I", |body, _| {
            body.push_insn(Instruction::ILoad(0));
            body.push_insn(Instruction::ILoad(0));
            body.push_insn(Instruction::IAdd);
            body.push_branch(BranchInstruction::IReturn);
        })
        .method(STATIC, "twice", "(J)J", |body, _| {
            body.push_insn(Instruction::LLoad(0));
            body.push_insn(Instruction::LLoad(0));
            body.push_insn(Instruction::LAdd);
            body.push_branch(BranchInstruction::LReturn);
        });
    fixture
}

/// `static int fail()`, which always throws an `IllegalStateException`
fn always_throws() -> Fixture {
    let mut fixture = Fixture::new(CLASS);
    fixture.method(STATIC, "fail", "()I", |body, pool| {
        let class = pool.get_class("java/lang/IllegalStateException").unwrap();
        let init = pool
            .get_method_ref("java/lang/IllegalStateException", "<init>", "()V", false)
            .unwrap();
        body.push_insn(Instruction::New(class));
        body.push_insn(Instruction::Dup);
        body.push_insn(Instruction::Invoke(InvokeType::Special, init));
        body.push_branch(BranchInstruction::AThrow);
    });
    fixture
}

#[test]
fn unmatched_classes_are_byte_identical() {
    let input = overloads().bytes();
    let replace_other = Replacement {
        descriptor: "()V".to_owned(),
        body: vec![Stmt::Return(None)],
    };

    // No rule for the class at all
    let unrelated = Transformer::new(
        vec![PatchRule::new(
            "elsewhere",
            "com/example/Elsewhere.run()V".parse().unwrap(),
            replace_other.clone(),
            0,
        )],
        Settings::default(),
    );
    assert_eq!(unrelated.transform(CLASS, &input), input);

    // Rules for the class, but none for a method it has
    let missing = transformer(vec![
        rule("twice()V", replace_other, 0),
        rule(
            "thrice(I)I",
            WrapGuard {
                catch_type: None,
                log: None,
                fallback: Fallback::Int(0),
            },
            0,
        ),
    ]);
    let transformed = missing.transform_with_report(CLASS, &input);
    assert_eq!(transformed.bytes, input);
    assert!(transformed
        .outcomes
        .iter()
        .all(|report| matches!(report.outcome, RuleOutcome::NoMatch)));
}

#[test]
fn abstract_methods_are_left_alone() {
    let mut fixture = Fixture::new(CLASS);
    fixture.abstract_method("size", "()I");
    let input = fixture.bytes();

    let guarded = transformer(vec![rule(
        "size()I",
        WrapGuard {
            catch_type: None,
            log: None,
            fallback: Fallback::Int(0),
        },
        0,
    )]);
    let transformed = guarded.transform_with_report(CLASS, &input);
    assert!(matches!(
        transformed.outcomes[0].outcome,
        RuleOutcome::Unchanged
    ));
    assert_eq!(transformed.bytes, input);
}

#[test]
fn exact_signature_matching() {
    let input = overloads().bytes();
    let replace = transformer(vec![rule(
        "twice(I)I",
        Replacement {
            descriptor: "(I)I".to_owned(),
            body: vec![Stmt::Return(Some(Expr::Int(42)))],
        },
        0,
    )]);
    let output = replace.transform(CLASS, &input);

    assert_ne!(
        method_code(&output, "twice", "(I)I"),
        method_code(&input, "twice", "(I)I")
    );
    assert_eq!(
        method_code(&output, "twice", "(J)J"),
        method_code(&input, "twice", "(J)J")
    );

    let mut host = Host::new();
    let int = run(&output, "twice", "(I)I", None, vec![Value::Int(5)], &mut host);
    assert_eq!(returned_int(int), 42);
    let long = run(&output, "twice", "(J)J", None, vec![Value::Long(5)], &mut host);
    assert_eq!(long, Outcome::Returned(Some(Value::Long(10))));
}

#[test]
fn wrapped_method_returns_sentinel() {
    let input = always_throws().bytes();
    let mut host = Host::new();
    assert_eq!(
        run(&input, "fail", "()I", None, vec![], &mut host),
        Outcome::Threw("java/lang/IllegalStateException".to_owned())
    );

    let wrap = |catch_type: &str| {
        transformer(vec![rule(
            "fail()I",
            WrapGuard {
                catch_type: Some(catch_type.to_owned()),
                log: Some(LogCall {
                    owner: "com/example/Log".to_owned(),
                    name: "suppressed".to_owned(),
                    descriptor: "(Ljava/lang/Throwable;)V".to_owned(),
                }),
                fallback: Fallback::Int(-1),
            },
            0,
        )])
    };

    let output = wrap("java/lang/IllegalStateException").transform(CLASS, &input);
    let mut host = Host::new();
    assert_eq!(
        returned_int(run(&output, "fail", "()I", None, vec![], &mut host)),
        -1
    );
    let logged = host.calls_to("com/example/Log.suppressed");
    assert_eq!(logged.len(), 1);
    assert!(matches!(
        &logged[0].args[..],
        [Value::Obj { class, .. }] if class == "java/lang/IllegalStateException"
    ));

    // Catching a superclass works too, an unrelated class does not
    let output = wrap("java/lang/RuntimeException").transform(CLASS, &input);
    assert_eq!(
        returned_int(run(&output, "fail", "()I", None, vec![], &mut Host::new())),
        -1
    );
    let output = wrap("java/io/IOException").transform(CLASS, &input);
    assert_eq!(
        run(&output, "fail", "()I", None, vec![], &mut Host::new()),
        Outcome::Threw("java/lang/IllegalStateException".to_owned())
    );
}

#[test]
fn first_matching_guard_wins() {
    let mut fixture = Fixture::new(CLASS);
    fixture.method(STATIC, "run", "(I)I", |body, _| {
        body.push_insn(Instruction::ILoad(0));
        body.push_branch(BranchInstruction::IReturn);
    });
    let input = fixture.bytes();

    let record = |tag: &str| {
        Stmt::Eval(Expr::call_static(
            "com/example/Log",
            "record",
            "(Ljava/lang/String;)V",
            vec![Expr::string(tag)],
        ))
    };
    let guard = |threshold: i32, tag: &str, result: i32| Guard {
        condition: Cond::Compare(OrdComparison::GT, Expr::Arg(0), Expr::Int(threshold)),
        tail: vec![record(tag), Stmt::Return(Some(Expr::Int(result)))],
    };
    let prologue = transformer(vec![rule(
        "run(I)I",
        PrologueGuard {
            guards: vec![guard(10, "first", 1), guard(5, "second", 2)],
        },
        0,
    )]);
    let output = prologue.transform(CLASS, &input);
    let recorded = |host: &Host| -> Vec<Value> {
        host.calls_to("com/example/Log.record")
            .iter()
            .flat_map(|call| call.args.clone())
            .collect()
    };

    // Both guards hold, only the first runs
    let mut host = Host::new();
    assert_eq!(
        returned_int(run(&output, "run", "(I)I", None, vec![Value::Int(20)], &mut host)),
        1
    );
    assert_eq!(recorded(&host), vec![Value::Str("first".to_owned())]);

    let mut host = Host::new();
    assert_eq!(
        returned_int(run(&output, "run", "(I)I", None, vec![Value::Int(7)], &mut host)),
        2
    );
    assert_eq!(recorded(&host), vec![Value::Str("second".to_owned())]);

    // Neither holds, the original body runs
    let mut host = Host::new();
    assert_eq!(
        returned_int(run(&output, "run", "(I)I", None, vec![Value::Int(3)], &mut host)),
        3
    );
    assert!(host.calls.is_empty());
}

#[test]
fn failed_rule_keeps_method_as_it_was() {
    let input = overloads().bytes();
    let wrong_arity = Replacement {
        descriptor: "(II)I".to_owned(),
        body: vec![Stmt::Return(Some(Expr::Arg(1)))],
    };

    // The rule targets `twice(I)I`, but the script was written for two arguments
    let failing = transformer(vec![rule("twice(I)I", wrong_arity.clone(), 0)]);
    let transformed = failing.transform_with_report(CLASS, &input);
    assert!(matches!(
        transformed.outcomes[0].outcome,
        RuleOutcome::Failed(Error::Patch(PatchError::DescriptorMismatch { .. }))
    ));
    assert_eq!(transformed.bytes, input);

    // Other rules on the same class still apply
    let mixed = transformer(vec![
        rule("twice(I)I", wrong_arity, 10),
        rule(
            "twice(J)J",
            Replacement {
                descriptor: "(J)J".to_owned(),
                body: vec![Stmt::Return(Some(Expr::Long(0)))],
            },
            0,
        ),
    ]);
    let output = mixed.transform(CLASS, &input);
    assert_eq!(
        method_code(&output, "twice", "(I)I"),
        method_code(&input, "twice", "(I)I")
    );
    assert_ne!(
        method_code(&output, "twice", "(J)J"),
        method_code(&input, "twice", "(J)J")
    );
}

#[test]
fn local_slots_past_the_limit_are_rejected() {
    let mut fixture = Fixture::new(CLASS);
    let shape = MethodShape::parse(CLASS, "edge", STATIC, "()I").unwrap();
    let mut body = MethodBody::new(shape);
    body.push_insn(Instruction::ILoad(65535));
    body.push_branch(BranchInstruction::IReturn);
    body.envelope.max_stack = 1;
    body.envelope.max_locals = u16::MAX;
    let code = body
        .encode(&mut fixture.class.constants, fixture.class.version)
        .unwrap();
    fixture
        .class
        .add_method(STATIC, "edge", "()I", Some(&code))
        .unwrap();
    let input = fixture.bytes();

    let wrap = transformer(vec![rule(
        "edge()I",
        WrapGuard {
            catch_type: None,
            log: None,
            fallback: Fallback::Default,
        },
        0,
    )]);
    let transformed = wrap.transform_with_report(CLASS, &input);
    assert!(matches!(
        transformed.outcomes[0].outcome,
        RuleOutcome::Failed(Error::Patch(PatchError::EnvelopeUnderflow(_)))
    ));
    assert_eq!(transformed.bytes, input);
}

#[test]
fn oversized_methods_are_rejected() {
    let input = overloads().bytes();
    let mut body = vec![];
    for _ in 0..20 {
        body.push(Stmt::Eval(Expr::call_static(
            "com/example/Log",
            "tick",
            "()V",
            vec![],
        )));
    }
    body.push(Stmt::Return(Some(Expr::Int(0))));
    let strict = Transformer::new(
        vec![rule(
            "twice(I)I",
            Replacement {
                descriptor: "(I)I".to_owned(),
                body,
            },
            0,
        )],
        Settings {
            max_code_length: 32,
            ..Settings::default()
        },
    );
    let transformed = strict.transform_with_report(CLASS, &input);
    assert!(matches!(
        transformed.outcomes[0].outcome,
        RuleOutcome::Failed(Error::Patch(PatchError::TooLarge(_)))
    ));
    assert_eq!(transformed.bytes, input);
}

/// Rules of every kind, over methods of every shape
fn mixed_rules() -> Vec<PatchRule> {
    vec![
        rule(
            "fail()I",
            WrapGuard {
                catch_type: Some("java/lang/IllegalStateException".to_owned()),
                log: None,
                fallback: Fallback::Int(-1),
            },
            0,
        ),
        rule(
            "run(I)I",
            PrologueGuard {
                guards: vec![Guard {
                    condition: Cond::Compare(OrdComparison::LT, Expr::Arg(0), Expr::Int(0)),
                    tail: vec![Stmt::Return(Some(Expr::Int(0)))],
                }],
            },
            5,
        ),
        rule(
            "run(I)I",
            WrapGuard {
                catch_type: None,
                log: None,
                fallback: Fallback::Default,
            },
            0,
        ),
        rule(
            "twice(J)J",
            Replacement {
                descriptor: "(J)J".to_owned(),
                body: vec![Stmt::Return(Some(Expr::Arg(0)))],
            },
            0,
        ),
    ]
}

#[test]
fn second_run_changes_nothing() {
    let mut fixture = always_throws();
    fixture
        .method(STATIC, "run", "(I)I", |body, _| {
            body.push_insn(Instruction::ILoad(0));
            body.push_branch(BranchInstruction::IReturn);
        })
        .method(STATIC, "twice", "(J)J", |body, _| {
            body.push_insn(Instruction::LLoad(0));
            body.push_insn(Instruction::LLoad(0));
            body.push_insn(Instruction::LAdd);
            body.push_branch(BranchInstruction::LReturn);
        });
    let input = fixture.bytes();
    let transformer = transformer(mixed_rules());

    let once = transformer.transform_with_report(CLASS, &input);
    assert!(once
        .outcomes
        .iter()
        .all(|report| report.outcome.is_applied()));

    let twice = transformer.transform_with_report(CLASS, &once.bytes);
    assert_eq!(twice.bytes, once.bytes);
    assert!(!twice.changed());

    let body = method_body(&once.bytes, "run", "(I)I");
    assert_eq!(body.handlers.len(), 1);
}

/// Random `static int f(int, int)` built from assignments, ifs, and counted loops
struct BodyGenerator<'r> {
    rng: &'r mut XorShift,
}

impl<'r> BodyGenerator<'r> {
    fn body(&mut self, body: &mut MethodBody) {
        for slot in 2..=4 {
            body.push_insn(Instruction::IConst0);
            body.push_insn(Instruction::IStore(slot));
        }
        for _ in 0..1 + self.rng.below(5) {
            self.statement(body, 0);
        }
        body.push_insn(Instruction::ILoad(2 + self.rng.below(3) as u16));
        body.push_branch(BranchInstruction::IReturn);
    }

    fn statement(&mut self, body: &mut MethodBody, depth: u16) {
        let choice = if depth < 2 {
            self.rng.below(4)
        } else {
            0
        };
        match choice {
            0 | 1 => {
                self.expression(body, 3);
                body.push_insn(Instruction::IStore(2 + self.rng.below(3) as u16));
            }
            2 => {
                self.expression(body, 2);
                let skip = body.fresh_label();
                body.push_branch(BranchInstruction::If(self.comparison(), skip));
                self.statement(body, depth + 1);
                body.place_label(skip);
            }
            _ => {
                let counter = 5 + depth;
                let head = body.fresh_label();
                let exit = body.fresh_label();
                body.push_insn(Instruction::BiPush(1 + self.rng.below(4) as i8));
                body.push_insn(Instruction::IStore(counter));
                body.place_label(head);
                body.push_insn(Instruction::ILoad(counter));
                body.push_branch(BranchInstruction::If(OrdComparison::LE, exit));
                self.statement(body, depth + 1);
                body.push_insn(Instruction::IInc(counter, -1));
                body.push_branch(BranchInstruction::Goto(head));
                body.place_label(exit);
            }
        }
    }

    fn expression(&mut self, body: &mut MethodBody, depth: usize) {
        if depth == 0 || self.rng.chance(30) {
            let leaf = match self.rng.below(5) {
                0 => Instruction::ILoad(self.rng.below(5) as u16),
                1 => Instruction::IConst2,
                2 => Instruction::BiPush(-(self.rng.below(100) as i8)),
                3 => Instruction::SiPush(self.rng.below(3000) as i16),
                _ => Instruction::IConstM1,
            };
            body.push_insn(leaf);
            return;
        }
        self.expression(body, depth - 1);
        if self.rng.chance(20) {
            body.push_insn(Instruction::INeg);
            return;
        }
        self.expression(body, depth - 1);
        let op = match self.rng.below(6) {
            0 => Instruction::IAdd,
            1 => Instruction::ISub,
            2 => Instruction::IMul,
            3 => Instruction::IAnd,
            4 => Instruction::IOr,
            _ => Instruction::IXor,
        };
        body.push_insn(op);
    }

    fn comparison(&mut self) -> OrdComparison {
        match self.rng.below(6) {
            0 => OrdComparison::EQ,
            1 => OrdComparison::NE,
            2 => OrdComparison::LT,
            3 => OrdComparison::LE,
            4 => OrdComparison::GT,
            _ => OrdComparison::GE,
        }
    }
}

fn identity() -> Vec<u8> {
    let mut fixture = Fixture::new(CLASS);
    fixture.method(STATIC, "run", "(I)I", |body, _| {
        body.push_insn(Instruction::ILoad(0));
        body.push_branch(BranchInstruction::IReturn);
    });
    fixture.bytes()
}

fn clamp_above(limit: i32) -> PrologueGuard {
    PrologueGuard {
        guards: vec![Guard {
            condition: Cond::Compare(OrdComparison::GT, Expr::Arg(0), Expr::Int(limit)),
            tail: vec![Stmt::Return(Some(Expr::Int(limit)))],
        }],
    }
}

/// Transform three times, checking that only the first run changes anything
fn settles_after_one_run(transformer: &Transformer, input: &[u8]) -> Vec<u8> {
    let once = transformer.transform_with_report(CLASS, input);
    assert!(once.changed());
    let twice = transformer.transform_with_report(CLASS, &once.bytes);
    assert!(!twice.changed());
    assert_eq!(twice.bytes, once.bytes);
    let thrice = transformer.transform(CLASS, &twice.bytes);
    assert_eq!(thrice, once.bytes);
    once.bytes
}

#[test]
fn prologue_in_front_of_wrap_is_not_repeated() {
    let transformer = transformer(vec![
        rule(
            "run(I)I",
            WrapGuard {
                catch_type: None,
                log: None,
                fallback: Fallback::Int(-1),
            },
            10,
        ),
        rule("run(I)I", clamp_above(100), 0),
    ]);
    let output = settles_after_one_run(&transformer, &identity());

    let body = method_body(&output, "run", "(I)I");
    assert_eq!(body.handlers.len(), 1);
    assert_ne!(body.label_position(body.handlers[0].start), Some(0));

    let mut host = Host::new();
    let clamped = run(&output, "run", "(I)I", None, vec![Value::Int(500)], &mut host);
    assert_eq!(returned_int(clamped), 100);
    let passed = run(&output, "run", "(I)I", None, vec![Value::Int(7)], &mut host);
    assert_eq!(returned_int(passed), 7);
}

#[test]
fn stacked_prologues_are_not_repeated() {
    let transformer = transformer(vec![
        rule("run(I)I", clamp_above(100), 10),
        rule("run(I)I", clamp_above(50), 0),
    ]);
    let input = identity();
    let output = settles_after_one_run(&transformer, &input);

    let body = method_body(&output, "run", "(I)I");
    assert_eq!(body.instruction_count(), 12);

    let mut host = Host::new();
    let clamped = run(&output, "run", "(I)I", None, vec![Value::Int(75)], &mut host);
    assert_eq!(returned_int(clamped), 50);
}

#[test]
fn patched_envelopes_cover_random_bodies() {
    let wrap = WrapGuard {
        catch_type: Some("java/lang/IllegalStateException".to_owned()),
        log: None,
        fallback: Fallback::Int(-7),
    };
    let prologue = PrologueGuard {
        guards: vec![
            Guard {
                condition: Cond::Compare(OrdComparison::LT, Expr::Arg(0), Expr::Int(0)),
                tail: vec![Stmt::Return(Some(Expr::Int(-1)))],
            },
            Guard {
                condition: Cond::Compare(OrdComparison::GT, Expr::Arg(1), Expr::Int(1000)),
                tail: vec![Stmt::SetArg {
                    index: 1,
                    value: Expr::Int(1000),
                }],
            },
        ],
    };
    let replacement = Replacement {
        descriptor: "(II)I".to_owned(),
        body: vec![
            Stmt::If {
                cond: Cond::Compare(OrdComparison::GT, Expr::Arg(0), Expr::Arg(1)),
                then: vec![Stmt::Return(Some(Expr::Arg(0)))],
                otherwise: vec![],
            },
            Stmt::Return(Some(Expr::Arg(1))),
        ],
    };
    let transformers = vec![
        ("wrap", transformer(vec![rule("f(II)I", wrap.clone(), 0)])),
        ("prologue", transformer(vec![rule("f(II)I", prologue.clone(), 0)])),
        ("replace", transformer(vec![rule("f(II)I", replacement, 0)])),
        (
            "prologue+wrap",
            transformer(vec![rule("f(II)I", prologue, 10), rule("f(II)I", wrap, 0)]),
        ),
    ];

    let mut rng = XorShift(0x5EED_CAFE);
    for seed in 0..150 {
        let mut fixture = Fixture::with_version(CLASS, Version::JAVA5);
        fixture.method(STATIC, "f", "(II)I", |body, _| {
            BodyGenerator { rng: &mut rng }.body(body)
        });
        let input = fixture.bytes();
        let original = method_body(&input, "f", "(II)I");

        for (name, transformer) in &transformers {
            let transformed = transformer.transform_with_report(CLASS, &input);
            assert!(
                transformed.changed(),
                "seed {}, {}: {:?}",
                seed,
                name,
                transformed.outcomes
            );
            let output = transformed.bytes;
            assert_eq!(transformer.transform(CLASS, &output), output);

            let class = ClassFile::parse(&output).unwrap();
            let patched = method_body(&output, "f", "(II)I");
            let declared = envelope::check(&patched, &class.constants)
                .unwrap_or_else(|err| panic!("seed {}, {}: {:?}", seed, name, err));
            if *name != "replace" {
                assert!(declared.max_stack >= original.envelope.max_stack);
                assert!(declared.max_locals >= original.envelope.max_locals);
            }

            for (a, b) in [(3, 4), (-2, 9), (0, 2000), (7, -3)] {
                let args = vec![Value::Int(a), Value::Int(b)];
                let result = returned_int(run(&output, "f", "(II)I", None, args, &mut Host::new()));
                let expected = match *name {
                    "replace" => a.max(b),
                    _ if name.starts_with("prologue") && a < 0 => -1,
                    _ => {
                        let b = if name.starts_with("prologue") { b.min(1000) } else { b };
                        let args = vec![Value::Int(a), Value::Int(b)];
                        returned_int(run(&input, "f", "(II)I", None, args, &mut Host::new()))
                    }
                };
                assert_eq!(result, expected, "seed {}, {}, f({}, {})", seed, name, a, b);
            }
        }
    }
}
