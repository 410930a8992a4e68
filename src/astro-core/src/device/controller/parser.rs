// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Response parsing into property deltas.
//!
//! SDK backends hand back typed values, so parsing is a field copy. The
//! line-oriented mount protocol returns `#`-terminated ASCII frames with a
//! fixed layout per command; those are validated for termination, length
//! and digit content before any field is read.

use thiserror::Error;

use crate::backend::{BackendKind, PropertyKey, PropertyValue};
use crate::device::command::FrameLayout;
use crate::device::state::{MountState, PierSide, PropertyDelta};
use crate::math::{self, centi_arcsec_to_deg, deg_to_centi_arcsec};

pub const FRAME_TERMINATOR: u8 = b'#';
/// Longest frame the mount sends; anything longer without `#` is garbage.
pub const MAX_FRAME_LEN: usize = 64;

const GEP_LEN: usize = 20;
const GLS_LEN: usize = 23;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("frame is not terminated by '#'")]
    Unterminated,
    #[error("frame too short: expected {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("invalid {field} field: {detail}")]
    InvalidField { field: &'static str, detail: String },
    #[error("unexpected value {value:?} for {key:?}")]
    UnexpectedValue { key: PropertyKey, value: PropertyValue },
    #[error("{0} does not produce this payload")]
    WrongBackend(BackendKind),
}

/// Raw result of one resolved exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Value(PropertyKey, PropertyValue),
    Frame(FrameLayout, Vec<u8>),
}

pub fn parse(kind: BackendKind, payload: &Payload) -> Result<PropertyDelta, ParseError> {
    match (kind, payload) {
        (BackendKind::ZwoEaf | BackendKind::ZwoCaa, Payload::Value(key, value)) => {
            parse_value(*key, *value)
        }
        (BackendKind::IOptron, Payload::Frame(layout, bytes)) => parse_frame(*layout, bytes),
        (kind, _) => Err(ParseError::WrongBackend(kind)),
    }
}

fn parse_value(key: PropertyKey, value: PropertyValue) -> Result<PropertyDelta, ParseError> {
    let unexpected = || ParseError::UnexpectedValue { key, value };
    let mut delta = PropertyDelta::default();
    match (key, value) {
        (PropertyKey::Position, v) => delta.position = Some(v.as_f64().ok_or_else(unexpected)?),
        (PropertyKey::Moving, PropertyValue::Motion { moving, hand_control }) => {
            delta.moving = Some(moving);
            delta.hand_control = Some(hand_control);
        }
        (PropertyKey::Moving, PropertyValue::Bool(moving)) => delta.moving = Some(moving),
        (PropertyKey::Temperature, v) => {
            delta.temperature_c = Some(v.as_f64().ok_or_else(unexpected)?)
        }
        (PropertyKey::MaxPosition, v) => {
            delta.max_position = Some(v.as_f64().ok_or_else(unexpected)?)
        }
        (PropertyKey::Reverse, PropertyValue::Bool(reverse)) => delta.reverse = Some(reverse),
        (PropertyKey::Backlash, PropertyValue::Int(steps)) => delta.backlash = Some(steps),
        _ => return Err(unexpected()),
    }
    Ok(delta)
}

/// Strip the terminator and check the body length.
fn frame_body(bytes: &[u8], min_len: usize) -> Result<&str, ParseError> {
    let Some((&last, body)) = bytes.split_last() else {
        return Err(ParseError::Unterminated);
    };
    if last != FRAME_TERMINATOR {
        return Err(ParseError::Unterminated);
    }
    if body.len() < min_len {
        return Err(ParseError::TooShort {
            expected: min_len + 1,
            actual: bytes.len(),
        });
    }
    std::str::from_utf8(body).map_err(|_| ParseError::InvalidField {
        field: "frame",
        detail: "not ASCII".into(),
    })
}

fn digits(body: &str, range: std::ops::Range<usize>, field: &'static str) -> Result<i64, ParseError> {
    let text = body.get(range).ok_or(ParseError::InvalidField {
        field,
        detail: "missing".into(),
    })?;
    if !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidField {
            field,
            detail: format!("'{}' is not numeric", text),
        });
    }
    text.parse().map_err(|_| ParseError::InvalidField {
        field,
        detail: format!("'{}' out of range", text),
    })
}

fn sign(body: &str, at: usize, field: &'static str) -> Result<i64, ParseError> {
    match body.as_bytes().get(at) {
        Some(b'+') => Ok(1),
        Some(b'-') => Ok(-1),
        other => Err(ParseError::InvalidField {
            field,
            detail: format!("bad sign {:?}", other.map(|b| *b as char)),
        }),
    }
}

fn parse_frame(layout: FrameLayout, bytes: &[u8]) -> Result<PropertyDelta, ParseError> {
    let mut delta = PropertyDelta::default();
    match layout {
        // sTTTTTTTTXXXXXXXXXEG#
        FrameLayout::MountPosition => {
            let body = frame_body(bytes, GEP_LEN)?;
            let dec = sign(body, 0, "declination")? * digits(body, 1..9, "declination")?;
            let ra = digits(body, 9..18, "right ascension")?;
            let pier = match digits(body, 18..19, "pier side")? {
                0 => PierSide::East,
                1 => PierSide::West,
                _ => PierSide::Unknown,
            };
            let dec_deg = centi_arcsec_to_deg(dec);
            if dec_deg.abs() > 90.0 {
                return Err(ParseError::InvalidField {
                    field: "declination",
                    detail: format!("{} out of range", dec_deg),
                });
            }
            delta.dec_deg = Some(dec_deg);
            delta.ra_hours = Some(math::normalize_degrees(centi_arcsec_to_deg(ra)) / 15.0);
            delta.pier_side = Some(pier);
        }
        // sTTTTTTTTTTTTTTTTnnnnnn#
        FrameLayout::MountStatus => {
            let body = frame_body(bytes, GLS_LEN)?;
            let longitude = sign(body, 0, "longitude")? * digits(body, 1..9, "longitude")?;
            // Latitude is sent offset by +90 degrees.
            let latitude = digits(body, 9..17, "latitude")?;
            let state = digits(body, 18..19, "system status")? as u8;
            let rate = digits(body, 19..20, "tracking rate")? as u8;
            delta.longitude = Some(centi_arcsec_to_deg(longitude));
            delta.latitude = Some(centi_arcsec_to_deg(latitude) - 90.0);
            delta.mount_state =
                Some(
                    MountState::from_digit(state).ok_or_else(|| ParseError::InvalidField {
                        field: "system status",
                        detail: format!("unknown status {}", state),
                    })?,
                );
            delta.tracking_rate = Some(rate);
        }
        FrameLayout::RightAscension => {
            let body = frame_body(bytes, 5)?;
            delta.ra_hours =
                Some(
                    math::parse_ra_hms(body).map_err(|e| ParseError::InvalidField {
                        field: "right ascension",
                        detail: e.to_string(),
                    })?,
                );
        }
        FrameLayout::Declination => {
            let body = frame_body(bytes, 5)?;
            delta.dec_deg =
                Some(
                    math::parse_dec_dms(body).map_err(|e| ParseError::InvalidField {
                        field: "declination",
                        detail: e.to_string(),
                    })?,
                );
        }
    }
    Ok(delta)
}

/// Reference encoder for the `:GEP#` reply.
pub fn encode_mount_position(ra_hours: f64, dec_deg: f64, pier: PierSide) -> String {
    let dec = deg_to_centi_arcsec(dec_deg.clamp(-90.0, 90.0));
    let ra = deg_to_centi_arcsec(math::normalize_degrees(ra_hours * 15.0)) % 129_600_000;
    let pier = match pier {
        PierSide::East => 0,
        PierSide::West => 1,
        PierSide::Unknown => 2,
    };
    format!(
        "{}{:08}{:09}{}1#",
        if dec < 0 { '-' } else { '+' },
        dec.abs(),
        ra,
        pier
    )
}

/// Reference encoder for the `:GLS#` reply.
pub fn encode_mount_status(
    longitude: f64,
    latitude: f64,
    state: MountState,
    tracking_rate: u8,
) -> String {
    let lon = deg_to_centi_arcsec(longitude.clamp(-180.0, 180.0));
    let lat = deg_to_centi_arcsec(latitude.clamp(-90.0, 90.0) + 90.0);
    format!(
        "{}{:08}{:08}2{}{}51{}#",
        if lon < 0 { '-' } else { '+' },
        lon.abs(),
        lat,
        state.digit(),
        tracking_rate.min(9),
        if latitude < 0.0 { 0 } else { 1 }
    )
}
