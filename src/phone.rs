/// Canonical form of a WhatsApp phone number: digits only, with the mobile
/// "9" dropped from 13-digit Brazilian numbers so both vendor spellings of
/// the same contact land on one ticket.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let mut digits = raw
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    if digits.is_empty() {
        return None;
    }
    if digits.len() == 13 && digits.starts_with("55") && digits.as_bytes()[4] == b'9' {
        digits.remove(4);
    }
    Some(digits)
}
