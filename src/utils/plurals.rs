/// `"1 chunk"`, `"3 chunks"`, `"2 entries"` (with an explicit plural).
pub fn pluralize(count: u64, singular: &str, plural: Option<&str>) -> String {
    if count == 1 {
        return format!("{count} {singular}");
    }

    match plural {
        Some(p) => format!("{count} {p}"),
        None => format!("{count} {singular}s"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_singular_only_for_one() {
        assert_eq!(pluralize(1, "shard", None), "1 shard");
        assert_eq!(pluralize(0, "shard", None), "0 shards");
        assert_eq!(pluralize(2, "entry", Some("entries")), "2 entries");
    }
}
