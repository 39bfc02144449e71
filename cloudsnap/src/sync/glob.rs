//! Glob matching for ignore lists and archive path selection.
//!
//! Only `*` and `**` are supported: `*` matches any run of characters except
//! the path separator, two or more consecutive stars match across separators
//! too. Matching is greedy with explicit backtrack positions, so the worst
//! case stays O(pattern · name) instead of going exponential.

pub fn match_glob(pattern: &str, name: &str) -> bool {
    let pattern = pattern.as_bytes();
    let name = name.as_bytes();
    let mut p = 0;
    let mut n = 0;
    // Positions just past the most recent single-star and double-star
    // expansion points. A single star cannot absorb '/', so crossing a
    // separator drops last_star but keeps last_dstar.
    let mut last_star: Option<usize> = None;
    let mut last_dstar: Option<usize> = None;

    while n < name.len() {
        if p == pattern.len() {
            if name[n] == b'/' {
                let Some(d) = last_dstar else { return false };
                last_star = Some(d);
                p = d;
                n += 1;
                continue;
            }
            let Some(s) = last_star else { return false };
            p = s;
            n += 1;
            continue;
        }
        if pattern[p] == b'*' {
            let mut stars = 0;
            while p < pattern.len() && pattern[p] == b'*' {
                p += 1;
                stars += 1;
            }
            last_star = Some(p);
            if stars >= 2 {
                last_dstar = Some(p);
            }
            continue;
        }
        if name[n] == b'/' {
            last_star = None;
        }
        if name[n] == pattern[p] {
            n += 1;
            p += 1;
        } else if let Some(s) = last_star {
            p = s;
            n += 1;
        } else if let Some(d) = last_dstar {
            last_star = Some(d);
            p = d;
            n += 1;
        } else {
            return false;
        }
    }
    // Remaining pattern must be all stars.
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}
