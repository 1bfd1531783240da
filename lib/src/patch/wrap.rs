use super::strategy::{canonical, run_matches};
use super::{PatchError, PatchOutcome};
use crate::jvm::class_file::ConstantPool;
use crate::jvm::code::{
    CodeBuilder, ExceptionHandler, Fragment, InvokeType, Label, LabelAllocator, MethodBody,
    MethodShape, StackDepthEnvelope,
};
use crate::jvm::verifier::{EditFrame, FrameType};
use crate::jvm::{
    BaseType, BinaryName, Error, FieldType, MethodDescriptor, Name, ParseDescriptor, RefType,
    RenderDescriptor,
};

/// Declared return types a string constant can be returned as
const STRING_SUPERTYPES: [&str; 5] = [
    "java/lang/String",
    "java/lang/Object",
    "java/lang/CharSequence",
    "java/lang/Comparable",
    "java/io/Serializable",
];

/// Wrap the whole body in an exception handler that returns a fallback value
///
/// The handler is registered after all existing handlers, so handlers already in the method
/// still get the first chance at exceptions thrown inside their ranges.
#[derive(Clone, Debug)]
pub struct WrapGuard {
    /// Class of exceptions to suppress (`None` suppresses everything)
    pub catch_type: Option<String>,

    /// Static method called from the handler before returning
    pub log: Option<LogCall>,

    pub fallback: Fallback,
}

/// Static method taking either nothing or the caught exception, and returning `void`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogCall {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

/// Value returned when the guard catches something
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fallback {
    /// `null`, `0`, `false`, or nothing for `void` methods
    Default,
    Int(i32),
    Long(i64),
    Bool(bool),
    Str(String),
}

impl WrapGuard {
    pub fn apply(
        &self,
        original: Option<&MethodBody>,
        pool: &mut ConstantPool,
    ) -> Result<PatchOutcome, PatchError> {
        let original = match original {
            None => return Ok(PatchOutcome::Unchanged),
            Some(original) => original,
        };
        if original.shape.is_constructor {
            return Err(PatchError::Unsupported(
                "wrapping a constructor body".to_owned(),
            ));
        }
        if original.instruction_count() == 0 {
            return Err(PatchError::Unsupported("empty method body".to_owned()));
        }
        self.check_fallback(&original.shape)?;

        // Build the handler once against scratch copies to recognize an earlier application
        let mut scratch_pool = pool.clone();
        let mut scratch_labels = original.labels.clone();
        let (_, tail) = self.handler(&mut scratch_pool, &mut scratch_labels, &original.shape)?;
        if self.already_wraps(original, &tail) {
            log::debug!("handler already present, leaving body as is");
            return Ok(PatchOutcome::Unchanged);
        }

        let mut body = original.clone();
        let first = body.first_instruction();
        let start = body.label_at(first);
        let (handler, tail) = self.handler(pool, &mut body.labels, &original.shape)?;

        body.nodes.extend(tail.nodes);
        body.frames.extend(tail.frames);
        body.handlers.push(ExceptionHandler {
            start,
            end: handler,
            handler,
            catch_type: self.catch_type.clone(),
        });
        body.envelope = original.envelope.dominate(StackDepthEnvelope {
            max_stack: tail.max_stack,
            max_locals: tail.max_locals,
        });
        Ok(PatchOutcome::Patched(body))
    }

    /// The fallback must be a value of exactly the declared return type
    ///
    /// `int` fallbacks may also be returned as `byte`, `short`, or `char` when they are in range.
    fn check_fallback(&self, shape: &MethodShape) -> Result<(), PatchError> {
        let found = match &self.fallback {
            Fallback::Default => return Ok(()),
            Fallback::Int(_) => "I",
            Fallback::Bool(_) => "Z",
            Fallback::Long(_) => "J",
            Fallback::Str(_) => "Ljava/lang/String;",
        };
        let fits = match (&self.fallback, shape.return_type()) {
            (Fallback::Int(int), Some(FieldType::Base(base_type))) => match base_type {
                BaseType::Int => true,
                BaseType::Short => i16::try_from(*int).is_ok(),
                BaseType::Byte => i8::try_from(*int).is_ok(),
                BaseType::Char => u16::try_from(*int).is_ok(),
                _ => false,
            },
            (Fallback::Bool(_), Some(FieldType::Base(BaseType::Boolean))) => true,
            (Fallback::Long(_), Some(FieldType::Base(BaseType::Long))) => true,
            (Fallback::Str(_), Some(FieldType::Ref(RefType::Object(class)))) => {
                STRING_SUPERTYPES.contains(&class.as_str())
            }
            _ => false,
        };
        if fits {
            return Ok(());
        }
        let expected = match shape.return_type() {
            Some(return_type) => return_type.render(),
            None => "V".to_owned(),
        };
        Err(PatchError::ReturnTypeMismatch {
            expected,
            found: found.to_owned(),
        })
    }

    /// Build the handler code, starting with its (placed) label
    ///
    /// The handler frame has no locals, so every point of the wrapped body is assignable to it.
    fn handler(
        &self,
        pool: &mut ConstantPool,
        labels: &mut LabelAllocator,
        shape: &MethodShape,
    ) -> Result<(Label, Fragment), PatchError> {
        let exception = match &self.catch_type {
            Some(class) => FrameType::object(class.as_str()),
            None => FrameType::object(BinaryName::THROWABLE.as_str()),
        };
        let frame = EditFrame {
            locals: vec![],
            stack: vec![exception],
        };

        let mut builder = CodeBuilder::new(pool, labels, shape, frame.clone());
        let handler = builder.fresh_label();
        builder.place_label_with_frame(handler, frame)?;

        match &self.log {
            None => builder.pop()?,
            Some(log_call) => {
                let descriptor: MethodDescriptor<BinaryName> =
                    MethodDescriptor::parse(&log_call.descriptor)
                        .map_err(|_| Error::BadDescriptor(log_call.descriptor.clone()))?;
                match (descriptor.parameters.as_slice(), &descriptor.return_type) {
                    ([], None) => builder.pop()?,
                    ([FieldType::Ref(_)], None) => (),
                    _ => {
                        return Err(PatchError::Unsupported(format!(
                            "log method {}.{}{} must take nothing or the exception",
                            log_call.owner, log_call.name, log_call.descriptor
                        )))
                    }
                }
                builder.invoke(
                    InvokeType::Static,
                    &log_call.owner,
                    &log_call.name,
                    &log_call.descriptor,
                )?;
            }
        }

        match (&self.fallback, shape.return_type()) {
            (Fallback::Default, None) => (),
            (Fallback::Default, Some(return_type)) => builder.zero_value(return_type)?,
            (Fallback::Int(integer), _) => builder.const_int(*integer)?,
            (Fallback::Bool(boolean), _) => builder.const_int(*boolean as i32)?,
            (Fallback::Long(long), _) => builder.const_long(*long)?,
            (Fallback::Str(string), _) => builder.const_string(string)?,
        }
        builder.return_()?;
        Ok((handler, builder.finish()))
    }

    /// Whether the body already has this handler
    ///
    /// Code added in front of the wrapped range by later patches does not matter: it is enough
    /// for a handler with the same catch type to end where this tail begins.
    fn already_wraps(&self, body: &MethodBody, tail: &Fragment) -> bool {
        let expected = canonical(&tail.nodes);
        body.handlers.iter().any(|handler| {
            if handler.catch_type != self.catch_type || handler.end != handler.handler {
                return false;
            }
            match (
                body.label_position(handler.start),
                body.label_position(handler.handler),
            ) {
                (Some(start), Some(position)) => {
                    start <= position && run_matches(&body.nodes, position, &expected)
                }
                _ => false,
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::code::{BranchInstruction, Instruction, OrdComparison};
    use crate::jvm::MethodAccessFlags;
    use crate::patch::script::{Cond, Expr, Stmt};
    use crate::patch::{Guard, PrologueGuard};

    fn throwing_body(pool: &mut ConstantPool, descriptor: &str) -> MethodBody {
        let shape =
            MethodShape::parse("com/example/Thing", "run", MethodAccessFlags::STATIC, descriptor)
                .unwrap();
        let mut body = MethodBody::new(shape);
        let class = pool.get_class("java/lang/IllegalStateException").unwrap();
        let init = pool
            .get_method_ref("java/lang/IllegalStateException", "<init>", "()V", false)
            .unwrap();
        body.push_insn(Instruction::New(class));
        body.push_insn(Instruction::Dup);
        body.push_insn(Instruction::Invoke(InvokeType::Special, init));
        body.push_branch(BranchInstruction::AThrow);
        body.envelope.max_stack = 2;
        body
    }

    fn guard(fallback: Fallback) -> WrapGuard {
        WrapGuard {
            catch_type: Some("java/lang/IllegalStateException".to_owned()),
            log: None,
            fallback,
        }
    }

    #[test]
    fn wraps_body() {
        let mut pool = ConstantPool::new();
        let original = throwing_body(&mut pool, "()I");
        let patched = match guard(Fallback::Int(-1)).apply(Some(&original), &mut pool) {
            Ok(PatchOutcome::Patched(body)) => body,
            other => panic!("unexpected {:?}", other),
        };

        assert_eq!(patched.handlers.len(), 1);
        let handler = &patched.handlers[0];
        assert_eq!(handler.end, handler.handler);
        assert_eq!(patched.label_position(handler.start), Some(0));
        assert!(patched.frames.contains_key(&handler.handler));
        assert_eq!(patched.envelope.max_stack, 2);
        assert_eq!(patched.instruction_count(), 7);
    }

    #[test]
    fn second_application_is_a_no_op() {
        let mut pool = ConstantPool::new();
        let original = throwing_body(&mut pool, "()I");
        let wrap = guard(Fallback::Int(-1));
        let patched = match wrap.apply(Some(&original), &mut pool) {
            Ok(PatchOutcome::Patched(body)) => body,
            other => panic!("unexpected {:?}", other),
        };
        assert!(matches!(
            wrap.apply(Some(&patched), &mut pool),
            Ok(PatchOutcome::Unchanged)
        ));

        // A different fallback is a different handler
        assert!(matches!(
            guard(Fallback::Int(7)).apply(Some(&patched), &mut pool),
            Ok(PatchOutcome::Patched(_))
        ));
    }

    #[test]
    fn recognised_behind_prepended_code() {
        let mut pool = ConstantPool::new();
        let original = throwing_body(&mut pool, "(I)I");
        let wrap = guard(Fallback::Int(-1));
        let wrapped = match wrap.apply(Some(&original), &mut pool) {
            Ok(PatchOutcome::Patched(body)) => body,
            other => panic!("unexpected {:?}", other),
        };
        let prologue = PrologueGuard {
            guards: vec![Guard {
                condition: Cond::Compare(OrdComparison::LT, Expr::Arg(0), Expr::Int(0)),
                tail: vec![Stmt::Return(Some(Expr::Int(0)))],
            }],
        };
        let guarded = match prologue.apply(Some(&wrapped), &mut pool) {
            Ok(PatchOutcome::Patched(body)) => body,
            other => panic!("unexpected {:?}", other),
        };
        assert_ne!(guarded.label_position(guarded.handlers[0].start), Some(0));
        assert!(matches!(
            wrap.apply(Some(&guarded), &mut pool),
            Ok(PatchOutcome::Unchanged)
        ));
    }

    #[test]
    fn missing_body_is_left_alone() {
        let mut pool = ConstantPool::new();
        assert!(matches!(
            guard(Fallback::Default).apply(None, &mut pool),
            Ok(PatchOutcome::Unchanged)
        ));
    }

    fn rejects(fallback: Fallback, descriptor: &str) -> bool {
        let mut pool = ConstantPool::new();
        let original = throwing_body(&mut pool, descriptor);
        matches!(
            guard(fallback).apply(Some(&original), &mut pool),
            Err(PatchError::ReturnTypeMismatch { .. })
        )
    }

    #[test]
    fn fallback_must_match_return_type() {
        assert!(rejects(Fallback::Long(0), "()Ljava/lang/Object;"));
        assert!(rejects(Fallback::Int(0), "()V"));
        assert!(rejects(Fallback::Int(0), "()J"));
        assert!(!rejects(Fallback::Default, "()V"));
        assert!(!rejects(Fallback::Default, "()Ljava/lang/Integer;"));
    }

    #[test]
    fn string_fallback_needs_a_string_return() {
        assert!(rejects(Fallback::Str("oops".to_owned()), "()Ljava/lang/Integer;"));
        assert!(rejects(Fallback::Str("oops".to_owned()), "()[Ljava/lang/String;"));
        assert!(!rejects(Fallback::Str("oops".to_owned()), "()Ljava/lang/String;"));
        assert!(!rejects(Fallback::Str("oops".to_owned()), "()Ljava/lang/Object;"));
        assert!(!rejects(Fallback::Str("oops".to_owned()), "()Ljava/lang/CharSequence;"));
    }

    #[test]
    fn boolean_fallback_needs_a_boolean_return() {
        assert!(!rejects(Fallback::Bool(true), "()Z"));
        assert!(rejects(Fallback::Bool(true), "()I"));
        assert!(rejects(Fallback::Int(1), "()Z"));
    }

    #[test]
    fn int_fallback_fits_narrow_returns() {
        assert!(!rejects(Fallback::Int(300), "()I"));
        assert!(rejects(Fallback::Int(300), "()B"));
        assert!(!rejects(Fallback::Int(-128), "()B"));
        assert!(rejects(Fallback::Int(-1), "()C"));
        assert!(!rejects(Fallback::Int(65535), "()C"));
        assert!(rejects(Fallback::Int(40000), "()S"));
        assert!(!rejects(Fallback::Int(-32768), "()S"));
        assert!(!rejects(Fallback::Long(1 << 40), "()J"));
    }

    #[test]
    fn log_call_receives_exception() {
        let mut pool = ConstantPool::new();
        let original = throwing_body(&mut pool, "()V");
        let wrap = WrapGuard {
            catch_type: None,
            log: Some(LogCall {
                owner: "com/example/Log".to_owned(),
                name: "warn".to_owned(),
                descriptor: "(Ljava/lang/Throwable;)V".to_owned(),
            }),
            fallback: Fallback::Default,
        };
        let patched = match wrap.apply(Some(&original), &mut pool) {
            Ok(PatchOutcome::Patched(body)) => body,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(patched.handlers[0].catch_type, None);

        // handler: invokestatic, return
        assert_eq!(patched.instruction_count(), 6);

        let bad = WrapGuard {
            log: Some(LogCall {
                owner: "com/example/Log".to_owned(),
                name: "warn".to_owned(),
                descriptor: "(I)V".to_owned(),
            }),
            ..wrap
        };
        assert!(matches!(
            bad.apply(Some(&original), &mut pool),
            Err(PatchError::Unsupported(_))
        ));
    }
}
