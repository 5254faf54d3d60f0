//! Request argument encoding for the helper's command line

/// Build the argument tokens for a data request
///
/// The table name comes first, then each ID as its own decimal token, in
/// the order given.
pub fn encode_request_args(table: &str, ids: &[u32]) -> Vec<String> {
    let mut args = Vec::with_capacity(ids.len() + 1);
    args.push(table.to_string());
    args.extend(ids.iter().map(u32::to_string));
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_then_ids_in_order() {
        let args = encode_request_args("results", &[42, 7, 4_000_000_000]);
        assert_eq!(args, vec!["results", "42", "7", "4000000000"]);
    }

    #[test]
    fn test_table_only() {
        assert_eq!(encode_request_args("parameters", &[]), vec!["parameters"]);
    }
}
