use rust_decimal::Decimal;

/// Render an amount for terminal output: thousands-grouped, two decimal
/// places, currency code suffixed. `-1234.5` → `-1,234.50 AUD`.
pub fn money(val: Decimal, currency: &str) -> String {
    let text = format!("{:.2}", val.round_dp(2));
    let (sign, digits) = match text.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", text.as_str()),
    };
    let (whole, frac) = digits.split_once('.').unwrap_or((digits, "00"));

    // Walk the integer part left to right; a separator goes wherever the
    // remaining digit count is a multiple of three.
    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (pos, digit) in whole.chars().enumerate() {
        if pos > 0 && (whole.len() - pos) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }

    format!("{sign}{grouped}.{frac} {currency}")
}

/// Two decimal places, no separators; the form used in ledger postings.
pub fn plain_amount(val: Decimal) -> String {
    format!("{:.2}", val.round_dp(2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_money_formatting() {
        assert_eq!(money(dec("1234.56"), "AUD"), "1,234.56 AUD");
        assert_eq!(money(dec("-500"), "USD"), "-500.00 USD");
        assert_eq!(money(dec("0"), "AUD"), "0.00 AUD");
        assert_eq!(money(dec("1000000.99"), "NZD"), "1,000,000.99 NZD");
        assert_eq!(money(dec("12.3"), "AUD"), "12.30 AUD");
    }

    #[test]
    fn test_plain_amount() {
        assert_eq!(plain_amount(dec("-10")), "-10.00");
        assert_eq!(plain_amount(dec("97.5")), "97.50");
    }
}
