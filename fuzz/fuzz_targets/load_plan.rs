#![no_main]

use std::fs;

use convoy::store::{load_plan, plan_path};
use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;

fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    if fs::write(plan_path(td.path()), data).is_ok() {
        let _ = load_plan(td.path());
    }
});
