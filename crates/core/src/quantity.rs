//! Cluster quantity strings to canonical units (millicores, MiB).
//!
//! Only the suffixes the scheduler reports in practice are understood; this is not a
//! general binary/decimal SI converter. Anything unparseable yields 0 because the values
//! feed sorting and charts, not validation.

/// `"500m"` → 500, `"2"` → 2000, `"0.5"` → 500.
pub fn to_milli_cores(s: &str) -> u64 {
    let s = s.trim();
    if let Some(milli) = s.strip_suffix('m') {
        return leading_number(milli).map(|v| v.trunc() as u64).unwrap_or(0);
    }
    leading_number(s).map(|v| (v * 1000.0).round() as u64).unwrap_or(0)
}

/// `"1Gi"` → 1024, `"512Mi"` → 512, `"2048Ki"` → 2. Unsuffixed values are taken as MiB already.
pub fn to_mebibytes(s: &str) -> f64 {
    let s = s.trim();
    if let Some(v) = s.strip_suffix("Gi") {
        return leading_number(v).map(|n| n * 1024.0).unwrap_or(0.0);
    }
    if let Some(v) = s.strip_suffix("Mi") {
        return leading_number(v).unwrap_or(0.0);
    }
    if let Some(v) = s.strip_suffix("Ki") {
        return leading_number(v).map(|n| n / 1024.0).unwrap_or(0.0);
    }
    leading_number(s).unwrap_or(0.0)
}

pub fn format_milli_cores(milli: u64) -> String {
    if milli % 1000 == 0 { format!("{}", milli / 1000) } else { format!("{}m", milli) }
}

pub fn format_mebibytes(mib: f64) -> String {
    if mib >= 1024.0 && (mib % 1024.0).abs() < f64::EPSILON {
        format!("{}Gi", (mib / 1024.0) as u64)
    } else if mib.fract().abs() < f64::EPSILON {
        format!("{}Mi", mib as u64)
    } else {
        format!("{:.1}Mi", mib)
    }
}

/// Parse the leading decimal number (`digits[.digits]`). `None` when the string does not
/// start with a digit.
fn leading_number(s: &str) -> Option<f64> {
    let mut end = 0usize;
    let mut seen_dot = false;
    for (i, c) in s.char_indices() {
        if c.is_ascii_digit() {
            end = i + 1;
        } else if c == '.' && !seen_dot && i > 0 {
            seen_dot = true;
        } else {
            break;
        }
    }
    if end == 0 { return None; }
    s[..end].parse::<f64>().ok()
}
