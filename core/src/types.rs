//! Shared primitive types used across the crate.

/// Store-assigned identifier of an account row (UUID v4 string).
pub type AccountId = String;

/// Store-assigned identifier of an invoice row (UUID v4 string).
pub type InvoiceId = String;

/// Currency amount in dollars. Change detection compares at cent precision.
pub type Money = f64;

/// Round to whole cents.
pub fn cents(amount: Money) -> i64 {
    (amount * 100.0).round() as i64
}

/// True when two amounts differ at cent precision.
pub fn money_differs(a: Money, b: Money) -> bool {
    cents(a) != cents(b)
}
