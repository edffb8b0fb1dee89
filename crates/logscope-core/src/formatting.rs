/// Fixed-precision number with comma grouping, as used in report tables.
///
/// ```
/// use logscope_core::formatting::format_number;
///
/// assert_eq!(format_number(48213.75, 1), "48,213.8");
/// assert_eq!(format_number(-2.5, 2), "-2.50");
/// ```
pub fn format_number(value: f64, decimals: u32) -> String {
    let scale = 10_f64.powi(decimals as i32);
    let scaled = (value.abs() * scale).round();

    let integer_part = (scaled / scale).trunc() as u64;
    let frac_units = (scaled - integer_part as f64 * scale).round() as u64;

    let grouped = group_thousands(&integer_part.to_string());
    let body = if decimals == 0 {
        grouped
    } else {
        format!(
            "{}.{:0width$}",
            grouped,
            frac_units,
            width = decimals as usize
        )
    };

    if value < 0.0 && scaled != 0.0 {
        format!("-{}", body)
    } else {
        body
    }
}

/// Format an integer count with thousands separators.
pub fn format_count(value: u64) -> String {
    group_thousands(&value.to_string())
}

/// Format a numeric sample: integral values print without a fractional part,
/// everything else with up to `max_decimals` digits (trailing zeros trimmed).
///
/// ```
/// use logscope_core::formatting::format_sample;
///
/// assert_eq!(format_sample(5.0, 3), "5");
/// assert_eq!(format_sample(-2.0, 3), "-2");
/// assert_eq!(format_sample(0.126, 2), "0.13");
/// assert_eq!(format_sample(1.5, 3), "1.5");
/// ```
pub fn format_sample(value: f64, max_decimals: usize) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        return format!("{}", value as i64);
    }
    let s = format!("{:.prec$}", value, prec = max_decimals);
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s
    }
}

/// Share of `part` in `whole` as a percentage rounded to `decimal_places`.
/// An empty `whole` yields `0.0`.
///
/// ```
/// use logscope_core::formatting::percentage;
///
/// assert!((percentage(2.0, 3.0, 1) - 66.7).abs() < 1e-9);
/// assert_eq!(percentage(3.0, 0.0, 1), 0.0);
/// ```
pub fn percentage(part: f64, whole: f64, decimal_places: u32) -> f64 {
    if whole == 0.0 {
        return 0.0;
    }
    let scale = 10_f64.powi(decimal_places as i32);
    (part * 100.0 / whole * scale).round() / scale
}

/// Shorten `text` to at most `max_chars` characters, appending `...` when
/// anything was cut.
pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}...", cut)
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn group_thousands(digits: &str) -> String {
    let len = digits.len();
    let mut out = String::with_capacity(len + len / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (len - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

// ── Tests ──────────────────────────────────────────────────────────────────────
