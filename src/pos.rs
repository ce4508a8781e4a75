//! Fractional position strings for ordered list children.
//!
//! List children carry their position as the `parentKey` of their parent
//! link. Positions are ASCII strings ordered lexicographically by byte
//! value; between any two positions another can always be generated, so
//! inserts never renumber siblings.
//!
//! Digits live in `[0x20, 0x7E]`. `0x20` acts as the implicit zero (it is
//! never emitted as a trailing digit) and `0x7F` is the virtual upper
//! bound, so every generated digit stays printable.

const MIN_DIGIT: u8 = 0x20;
const MAX_DIGIT: u8 = 0x7F;

/// Generate a position strictly between `lo` and `hi`.
///
/// `None` on either side means the open end of the list. When both are
/// `None` the result is the canonical first position.
pub fn between(lo: Option<&str>, hi: Option<&str>) -> String {
    let lo = lo.map(str::as_bytes).unwrap_or(b"");
    let hi = hi.map(str::as_bytes).unwrap_or(b"");
    let mut out: Vec<u8> = Vec::with_capacity(lo.len().max(hi.len()) + 1);

    let mut i = 0;
    loop {
        let l = lo.get(i).copied().unwrap_or(MIN_DIGIT);
        let h = hi.get(i).copied().unwrap_or(MAX_DIGIT);

        if l == h {
            out.push(l);
            i += 1;
            continue;
        }
        if h - l > 1 {
            out.push(l + (h - l) / 2);
            break;
        }

        // Adjacent digits: keep the low digit, then find room after the
        // low bound's remaining tail (upper bound becomes virtual max).
        out.push(l);
        i += 1;
        loop {
            let l2 = lo.get(i).copied().unwrap_or(MIN_DIGIT);
            if MAX_DIGIT - l2 > 1 {
                out.push(l2 + (MAX_DIGIT - l2) / 2);
                break;
            }
            out.push(l2);
            i += 1;
        }
        break;
    }

    // Safety net: positions are always printable ASCII, valid UTF-8.
    String::from_utf8(out).unwrap_or_default()
}

/// Position after the last child (or the first position for an empty list).
pub fn after(last: Option<&str>) -> String {
    between(last, None)
}

/// Position before the first child.
pub fn before(first: Option<&str>) -> String {
    between(None, first)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_position() {
        let p = between(None, None);
        assert!(!p.is_empty());
    }

    #[test]
    fn test_between_orders() {
        let a = between(None, None);
        let b = after(Some(&a));
        let c = after(Some(&b));
        assert!(a < b && b < c);

        let mid = between(Some(&a), Some(&b));
        assert!(a < mid && mid < b);
    }

    #[test]
    fn test_before_first() {
        let a = between(None, None);
        let p = before(Some(&a));
        assert!(p < a);
    }

    #[test]
    fn test_adjacent_digits_still_split() {
        // "P" and "Q" are adjacent; the midpoint must extend the string.
        let mid = between(Some("P"), Some("Q"));
        assert!(mid.as_str() > "P" && mid.as_str() < "Q");
        assert!(mid.len() > 1);
    }

    #[test]
    fn test_dense_inserts_stay_ordered() {
        // Repeatedly split the same gap; order must hold throughout.
        let lo = between(None, None);
        let hi = after(Some(&lo));
        let mut upper = hi.clone();
        for _ in 0..64 {
            let mid = between(Some(&lo), Some(&upper));
            assert!(mid > lo && mid < upper, "{lo:?} < {mid:?} < {upper:?}");
            upper = mid;
        }
        // And splitting upward from the low end.
        let mut lower = lo;
        for _ in 0..64 {
            let mid = between(Some(&lower), Some(&hi));
            assert!(mid > lower && mid < hi);
            lower = mid;
        }
    }

    #[test]
    fn test_positions_are_printable() {
        let mut pos = between(None, None);
        for _ in 0..200 {
            pos = after(Some(&pos));
            assert!(pos.bytes().all(|b| (0x20..=0x7E).contains(&b)));
        }
    }
}
