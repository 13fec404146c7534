#![no_main]

use convoy::types::BumpKind;
use convoy::version::{ParsedTag, bump_semantic, format_tag, parse_tag};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(tag) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(ParsedTag::Semantic(version)) = parse_tag(tag) {
        // A formatted tag must parse back to the same version.
        let formatted = format_tag(&version);
        assert_eq!(parse_tag(&formatted).ok(), Some(ParsedTag::Semantic(version.clone())));

        if [version.major, version.minor, version.patch].contains(&u64::MAX) {
            return;
        }
        for bump in [BumpKind::Patch, BumpKind::Minor, BumpKind::Major] {
            assert!(bump_semantic(&version, bump) > version);
        }
    }
});
