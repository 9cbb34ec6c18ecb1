// Authority domain syntax and the trailing-label similarity matcher
// (spec.md §3, §4.6, §8).

/// Validates that `domain` is a syntactically valid DNS-like authority
/// domain: non-empty, composed of non-empty dot-separated labels.
pub fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() {
        return false;
    }
    domain.split('.').all(|label| !label.is_empty())
}

/// Number of trailing dot-separated labels `a` and `b` share, counting from
/// the right. `similarity("app.prod.example.com", "db.prod.example.com")`
/// is 3 (`prod.example.com`); two domains that differ in every label (or an
/// empty one) have similarity 0.
pub fn similarity(a: &str, b: &str) -> usize {
    let a_labels: Vec<&str> = a.split('.').collect();
    let b_labels: Vec<&str> = b.split('.').collect();
    a_labels
        .iter()
        .rev()
        .zip(b_labels.iter().rev())
        .take_while(|(x, y)| x == y)
        .count()
}

/// Picks the best match for `query` among `domains` by trailing-label
/// similarity, breaking ties in favor of the first encountered. Per
/// spec.md §4.6/§9, a zero-similarity candidate is never returned — callers
/// should treat `None` as `NotFound`.
pub fn best_match<'a, I>(query: &str, domains: I) -> Option<(usize, usize)>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best: Option<(usize, usize)> = None; // (index, similarity)
    for (idx, domain) in domains.into_iter().enumerate() {
        let sim = similarity(query, domain);
        if sim == 0 {
            continue;
        }
        match best {
            Some((_, best_sim)) if sim <= best_sim => {}
            _ => best = Some((idx, sim)),
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_domain() {
        assert!(!is_valid_domain(""));
    }

    #[test]
    fn rejects_empty_label() {
        assert!(!is_valid_domain("a..b"));
        assert!(!is_valid_domain(".a.b"));
        assert!(!is_valid_domain("a.b."));
    }

    #[test]
    fn accepts_well_formed_domain() {
        assert!(is_valid_domain("east.example.com"));
        assert!(is_valid_domain("a"));
    }

    #[test]
    fn similarity_counts_trailing_labels() {
        assert_eq!(similarity("a.b.c", "x.b.c"), 2);
        assert_eq!(similarity("a.b.c", "y.c"), 1);
        assert_eq!(similarity("a.b.c", "z.d"), 0);
    }

    #[test]
    fn similarity_tie_break_prefers_first() {
        let domains = ["x.b.c", "y.c", "z.d"];
        let m = best_match("a.b.c", domains);
        assert_eq!(m, Some((0, 2)));
    }

    #[test]
    fn similarity_resolution_seed_five() {
        let domains = ["app.prod.example.com", "db.prod.example.com"];
        let m = best_match("cache.prod.example.com", domains);
        assert_eq!(m, Some((0, 3)));
    }

    #[test]
    fn zero_similarity_never_matches() {
        let domains = ["totally.unrelated"];
        assert_eq!(best_match("east.example.com", domains), None);
    }
}
