//! Maps owners to the storage bucket that holds their objects.

/// Bucket names must fit object-storage naming rules (3–63 characters).
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;

/// Every owner has one bucket. Its name is derived from the owner id:
/// lowercased, with anything outside `[a-z0-9-]` replaced by `-`, trimmed of
/// leading/trailing hyphens and padded or truncated to a valid length.
pub fn bucket_for_owner(owner_id: &str) -> String {
    let mapped: String = owner_id
        .chars()
        .map(|c| c.to_ascii_lowercase())
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();

    let mut name = mapped.trim_matches('-').to_string();
    name.truncate(BUCKET_NAME_MAX_LEN);
    let mut name = name.trim_end_matches('-').to_string();
    while name.len() < BUCKET_NAME_MIN_LEN {
        name.push('0');
    }
    name
}

#[cfg(test)]
mod tests {
    use super::bucket_for_owner;

    #[test]
    fn normalizes_owner_ids() {
        assert_eq!(bucket_for_owner("Alice.Smith@Corp"), "alice-smith-corp");
        assert_eq!(bucket_for_owner("5e1f"), "5e1f");
    }

    #[test]
    fn pads_and_truncates() {
        assert_eq!(bucket_for_owner("a"), "a00");
        assert_eq!(bucket_for_owner("__"), "000");

        let long = "x".repeat(100);
        assert_eq!(bucket_for_owner(&long).len(), 63);
    }
}
