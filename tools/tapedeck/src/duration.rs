use std::time::Duration;

/// Parse a delay like `250ms`, `2s`, `1m` or a bare number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let (num_str, suffix) = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| (&s[..i], &s[i..]))
        .unwrap_or((s, ""));

    let num: u64 = num_str
        .parse()
        .map_err(|_| format!("invalid number in duration: {s}"))?;

    match suffix.trim() {
        "us" | "µs" => Ok(Duration::from_micros(num)),
        "ms" => Ok(Duration::from_millis(num)),
        "" | "s" | "sec" | "secs" => Ok(Duration::from_secs(num)),
        "m" | "min" | "mins" => Ok(Duration::from_secs(num * 60)),
        other => Err(format!("unknown duration suffix: {other}")),
    }
}
