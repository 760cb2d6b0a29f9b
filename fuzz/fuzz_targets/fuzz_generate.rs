#![no_main]
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use qcode_sync::{CategoryValues, IdentifierGenerator, SchemeVersion, UniquenessResolver, UsedSet};

#[derive(Arbitrary, Debug)]
struct Input {
    exam_type: String,
    exam_class: String,
    subject: String,
    kind: String,
    round: Option<u32>,
    count: u8,
}

fuzz_target!(|input: Input| {
    let values = CategoryValues::parse(&input.exam_type, &input.exam_class, &input.subject, &input.kind);

    for version in [SchemeVersion::V1, SchemeVersion::V2] {
        let generator = IdentifierGenerator::new(version);
        let mut used = UsedSet::new();

        for _ in 0..input.count {
            let Ok(generated) = generator.generate(&values, input.round, &used) else {
                break;
            };
            assert!(version.primary().matches(&generated.identifier), "{}", generated.identifier);
            assert!(!used.contains(&generated.identifier));
            UniquenessResolver.register(generated.identifier, &mut used);
        }
    }
});
