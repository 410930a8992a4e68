// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use crate::DynResult;

const CENTI_ARCSEC_PER_DEG: f64 = 360_000.0;

/// Wrap an angle into [0, 360).
pub fn normalize_degrees(deg: f64) -> f64 {
    let wrapped = deg.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs.
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Degrees to the 0.01 arc-second integer unit used by iOptron frames.
pub fn deg_to_centi_arcsec(deg: f64) -> i64 {
    (deg * CENTI_ARCSEC_PER_DEG).round() as i64
}

pub fn centi_arcsec_to_deg(value: i64) -> f64 {
    value as f64 / CENTI_ARCSEC_PER_DEG
}

/// Format right ascension (hours) as `HH:MM:SS`.
pub fn format_ra_hms(hours: f64) -> String {
    let total = (hours.rem_euclid(24.0) * 3600.0).round() as u64 % (24 * 3600);
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total / 60) % 60,
        total % 60
    )
}

/// Format declination (degrees) as `sDD*MM:SS`.
pub fn format_dec_dms(deg: f64) -> String {
    let sign = if deg < 0.0 { '-' } else { '+' };
    let total = (deg.abs().min(90.0) * 3600.0).round() as u64;
    format!(
        "{}{:02}*{:02}:{:02}",
        sign,
        total / 3600,
        (total / 60) % 60,
        total % 60
    )
}

/// Parse `HH:MM:SS`, `HH:MM:SS.S` or `HH:MM.T` into hours.
pub fn parse_ra_hms(text: &str) -> DynResult<f64> {
    let fields = split_fields(text.trim())?;
    let hours = match fields.as_slice() {
        [h, m, s] => *h + *m / 60.0 + *s / 3600.0,
        [h, m] => *h + *m / 60.0,
        _ => return Err("right ascension must have two or three fields".into()),
    };
    if !(0.0..24.0).contains(&hours) {
        return Err("right ascension out of range".into());
    }
    Ok(hours)
}

/// Parse `sDD*MM:SS` (also `:`, `°` or the LX200 0xDF byte as separators)
/// into degrees.
pub fn parse_dec_dms(text: &str) -> DynResult<f64> {
    let text = text.trim();
    let (negative, body) = match text.chars().next() {
        Some('-') => (true, &text[1..]),
        Some('+') => (false, &text[1..]),
        Some(c) if c.is_ascii_digit() => (false, text),
        _ => return Err("declination must start with a sign or digit".into()),
    };
    let fields = split_fields(body)?;
    let magnitude = match fields.as_slice() {
        [d, m, s] => *d + *m / 60.0 + *s / 3600.0,
        [d, m] => *d + *m / 60.0,
        _ => return Err("declination must have two or three fields".into()),
    };
    if magnitude > 90.0 {
        return Err("declination out of range".into());
    }
    Ok(if negative { -magnitude } else { magnitude })
}

fn split_fields(text: &str) -> DynResult<Vec<f64>> {
    let mut fields = Vec::with_capacity(3);
    for part in text.split(|c: char| matches!(c, ':' | '*' | '\u{b0}' | '\u{df}' | '\u{fffd}')) {
        if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit() || c == '.') {
            return Err(format!("invalid sexagesimal field '{}'", part).into());
        }
        let value: f64 = part
            .parse()
            .map_err(|_| format!("invalid sexagesimal field '{}'", part))?;
        fields.push(value);
    }
    if fields.iter().skip(1).any(|v| *v >= 60.0) {
        return Err("minutes/seconds must be below 60".into());
    }
    Ok(fields)
}
