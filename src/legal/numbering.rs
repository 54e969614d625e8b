//! Sequential reference numbers of the form `PREFIX-YYYY-NNNN`.

pub const MATTER_PREFIX: &str = "MAT";
pub const INVOICE_PREFIX: &str = "INV";

/// The shared prefix for a kind and year, e.g. `MAT-2025-`.
pub fn year_prefix(kind: &str, year: i32) -> String {
    format!("{kind}-{year}-")
}

/// Next number after the highest existing sequence with the same prefix.
/// Entries that don't end in digits are ignored.
pub fn next_number(kind: &str, year: i32, existing: &[String]) -> String {
    let prefix = year_prefix(kind, year);
    let highest = existing
        .iter()
        .filter_map(|number| number.strip_prefix(&prefix))
        .filter_map(|suffix| suffix.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    format!("{prefix}{:04}", highest.saturating_add(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_number_of_year() {
        assert_eq!(next_number(MATTER_PREFIX, 2025, &[]), "MAT-2025-0001");
    }

    #[test]
    fn continues_after_highest_and_skips_foreign_numbers() {
        let existing = vec![
            "INV-2025-0003".to_string(),
            "INV-2025-0010".to_string(),
            "INV-2025-CUSTOM".to_string(),
            "INV-2024-0099".to_string(),
        ];
        assert_eq!(next_number(INVOICE_PREFIX, 2025, &existing), "INV-2025-0011");
    }

    #[test]
    fn widens_past_four_digits() {
        let existing = vec!["MAT-2025-9999".to_string()];
        assert_eq!(next_number(MATTER_PREFIX, 2025, &existing), "MAT-2025-10000");
    }
}
