use cacheproxy::{cache_key, Blacklist, Capture};
use quickcheck_macros::quickcheck;

#[quickcheck]
fn empty_blacklist_blocks_nothing(host: String) -> bool {
    !Blacklist::empty().is_blocked(&host)
}

#[quickcheck]
fn host_is_blocked_by_itself(host: String) -> bool {
    // Empty patterns are dropped on load, so they never match.
    let blacklist = Blacklist::from_patterns([host.clone()]);
    blacklist.is_blocked(&host) == !host.is_empty()
}

#[quickcheck]
fn cache_key_width_is_fixed(url: String) -> bool {
    cache_key(&url).as_str().len() == 32
}

#[quickcheck]
fn capture_keeps_an_exact_prefix(chunks: Vec<Vec<u8>>, limit: u8) -> bool {
    let limit = usize::from(limit);
    let mut capture = Capture::new(limit);
    for chunk in &chunks {
        capture.push(chunk);
    }
    let all = chunks.concat();
    let truncated = capture.is_truncated();
    let kept = capture.into_bytes();
    kept.len() == all.len().min(limit) && kept[..] == all[..kept.len()] && truncated == (all.len() > limit)
}
