use std::cmp::Ordering;

/// Compare two dotted version strings segment by segment.
///
/// Numeric segments compare numerically, non-numeric segments lexically, and
/// a missing segment counts as zero, so `1.2` < `1.2.1` and `1.9` < `1.10`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (l, r) => {
                let l = l.unwrap_or("0");
                let r = r.unwrap_or("0");
                let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(ln), Ok(rn)) => ln.cmp(&rn),
                    _ => l.cmp(r),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// True when `candidate` satisfies a minimum version requirement.
pub fn version_at_least(candidate: &str, minimum: &str) -> bool {
    compare_versions(candidate, minimum) != Ordering::Less
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_segments_compare_numerically() {
        assert_eq!(compare_versions("1.9.0", "1.10.0"), Ordering::Less);
        assert_eq!(compare_versions("2.0.0", "1.99.99"), Ordering::Greater);
        assert_eq!(compare_versions("1.2.3", "1.2.3"), Ordering::Equal);
    }

    #[test]
    fn missing_segments_count_as_zero() {
        assert_eq!(compare_versions("1.2", "1.2.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.2", "1.2.1"), Ordering::Less);
    }

    #[test]
    fn at_least_is_inclusive() {
        assert!(version_at_least("18.0.0", "18.0.0"));
        assert!(version_at_least("18.1.0", "18.0.0"));
        assert!(!version_at_least("17.9.9", "18.0.0"));
    }
}
