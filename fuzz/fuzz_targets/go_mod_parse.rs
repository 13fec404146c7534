#![no_main]

use convoy::manifest::{GoModHandler, ManifestHandler};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(content) = std::str::from_utf8(data) else {
        return;
    };

    let handler = GoModHandler;
    let Ok(manifest) = handler.parse(content) else {
        return;
    };

    for dep in &manifest.dependencies {
        if let Ok(Some(rewritten)) = handler.rewrite_dependency(content, dep, "v9.9.9") {
            let reparsed = handler
                .parse(&rewritten)
                .expect("rewritten go.mod must still parse");
            assert_eq!(reparsed.dependencies.len(), manifest.dependencies.len());
        }
    }
});
