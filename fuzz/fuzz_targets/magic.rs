#![no_main]

use libfuzzer_sys::fuzz_target;
use nsmux::magic::{find_separator, unescape};

fuzz_target!(|data: &[u8]| {
    let Ok(name) = std::str::from_utf8(data) else {
        return;
    };

    // the scan never panics and never points past the pair
    if let Some(sep) = find_separator(name) {
        assert!(sep + 2 <= name.len());
        assert_eq!(&name[sep..sep + 2], ",,");
        assert_ne!(name.as_bytes().get(sep + 2), Some(&b','));
    }

    // unescaping only ever shrinks, and reaches a fixpoint
    let mut cooked = name.to_owned();
    let mut previous = cooked.len() + 1;
    while cooked.len() < previous {
        previous = cooked.len();
        let len = cooked.len();
        unescape(&mut cooked, len);
        assert!(cooked.len() <= previous);
    }

    // once at the fixpoint, the split never moves again
    let settled = find_separator(&cooked);
    let mut again = cooked.clone();
    let len = again.len();
    unescape(&mut again, len);
    assert_eq!(find_separator(&again), settled);
});
