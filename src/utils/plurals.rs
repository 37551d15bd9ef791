/// `singular` when `count` is one, else `plural` or `singular` + "s".
pub fn pluralize(count: usize, singular: &str, plural: Option<&str>) -> String {
    match (count, plural) {
        (1, _) => singular.to_string(),
        (_, Some(p)) => p.to_string(),
        (_, None) => format!("{singular}s"),
    }
}
