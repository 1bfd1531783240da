#![allow(dead_code)]

pub mod interpreter;

use classpatch::jvm::class_file::{ClassFile, Code, ConstantPool, Version};
use classpatch::jvm::code::{MethodBody, MethodShape};
use classpatch::jvm::{ClassAccessFlags, MethodAccessFlags};
use classpatch::patch::envelope;

/// Builds small classes to feed through the patcher
pub struct Fixture {
    pub class: ClassFile,
}

impl Fixture {
    pub fn new(name: &str) -> Fixture {
        Fixture::with_version(name, Version::JAVA8)
    }

    /// Classes before major version 50 carry no stack map frames, so bodies with branches need none
    pub fn with_version(name: &str, version: Version) -> Fixture {
        Fixture {
            class: ClassFile::new(
                name,
                Some("java/lang/Object"),
                ClassAccessFlags::PUBLIC,
                version,
            )
            .unwrap(),
        }
    }

    /// Add a method, with an envelope computed from its body
    pub fn method(
        &mut self,
        access_flags: MethodAccessFlags,
        name: &str,
        descriptor: &str,
        build: impl FnOnce(&mut MethodBody, &mut ConstantPool),
    ) -> &mut Fixture {
        let this_class = self.class.name().unwrap().to_owned();
        let shape = MethodShape::parse(&this_class, name, access_flags, descriptor).unwrap();
        let mut body = MethodBody::new(shape);
        build(&mut body, &mut self.class.constants);
        body.envelope = envelope::observe(&body, &self.class.constants)
            .unwrap()
            .envelope;
        let code = body
            .encode(&mut self.class.constants, self.class.version)
            .unwrap();
        self.class
            .add_method(access_flags, name, descriptor, Some(&code))
            .unwrap();
        self
    }

    pub fn abstract_method(&mut self, name: &str, descriptor: &str) -> &mut Fixture {
        self.class
            .add_method(
                MethodAccessFlags::PUBLIC | MethodAccessFlags::ABSTRACT,
                name,
                descriptor,
                None,
            )
            .unwrap();
        self
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.class.to_bytes().unwrap()
    }
}

pub const STATIC: MethodAccessFlags = MethodAccessFlags::from_bits_truncate(
    MethodAccessFlags::PUBLIC.bits() | MethodAccessFlags::STATIC.bits(),
);

/// `Code` of a method given by name and descriptor
pub fn method_code(bytes: &[u8], name: &str, descriptor: &str) -> Option<Code> {
    let class = ClassFile::parse(bytes).unwrap();
    let index = method_index(&class, name, descriptor)?;
    class.method_code(index).unwrap()
}

/// Decoded body of a method given by name and descriptor
pub fn method_body(bytes: &[u8], name: &str, descriptor: &str) -> MethodBody {
    let class = ClassFile::parse(bytes).unwrap();
    let index = method_index(&class, name, descriptor).unwrap();
    let method = &class.methods[index];
    let shape = MethodShape::parse(
        class.name().unwrap(),
        name,
        method.access_flags,
        descriptor,
    )
    .unwrap();
    let code = class.method_code(index).unwrap().unwrap();
    MethodBody::decode(&code, &class.constants, shape).unwrap()
}

pub fn method_index(class: &ClassFile, name: &str, descriptor: &str) -> Option<usize> {
    class.methods.iter().position(|method| {
        class.method_name(method).unwrap() == name
            && class.method_descriptor(method).unwrap() == descriptor
    })
}

/// Deterministic `xorshift64*` generator
pub struct XorShift(pub u64);

impl XorShift {
    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Uniform-ish value in `0..bound`
    pub fn below(&mut self, bound: usize) -> usize {
        (self.next_u64() % bound as u64) as usize
    }

    pub fn chance(&mut self, percent: usize) -> bool {
        self.below(100) < percent
    }
}
