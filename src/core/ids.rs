//! Job identifier generation (spec §3: a random 128-bit value rendered in
//! canonical 8-4-4-4-12 hex form).

use uuid::Uuid;

/// Generate a new job id. A UUID v4 already is exactly this: 128 bits of
/// randomness in the canonical hyphenated hex form.
pub fn new_job_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_canonical_hex() {
        let id = new_job_id();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 5);
        assert_eq!(
            parts.iter().map(|p| p.len()).collect::<Vec<_>>(),
            vec![8, 4, 4, 4, 12]
        );
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() || c == '-'));
    }

    #[test]
    fn ids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(new_job_id()));
        }
    }
}
