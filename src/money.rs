//! Minor-unit money arithmetic.
//!
//! All balances are carried as integer kobo (`i64`). Conversion to major
//! units happens only when rendering customer-facing messages.

/// Minor units per major currency unit (kobo per naira).
pub const MINOR_PER_MAJOR: i64 = 100;

/// Amount in minor units.
pub type Minor = i64;

/// Subtract `amount` from `balance`, clamping at zero. Returns the new
/// balance and the portion of `amount` actually absorbed.
pub fn deduct_clamped(balance: Minor, amount: Minor) -> (Minor, Minor) {
    let absorbed = amount.min(balance);
    (balance - absorbed, absorbed)
}

/// Render a minor-unit amount as a major-unit string with two decimals and
/// thousands separators, e.g. `142000 -> "1,420.00"`.
pub fn format_major(minor: Minor) -> String {
    let negative = minor < 0;
    let abs = minor.unsigned_abs();
    let major = abs / MINOR_PER_MAJOR as u64;
    let cents = abs % MINOR_PER_MAJOR as u64;

    let digits = major.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }

    let sign = if negative { "-" } else { "" };
    format!("{}{}.{:02}", sign, grouped, cents)
}
