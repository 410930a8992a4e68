// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

pub mod sexagesimal;

pub use sexagesimal::{
    centi_arcsec_to_deg, deg_to_centi_arcsec, format_dec_dms, format_ra_hms, normalize_degrees,
    parse_dec_dms, parse_ra_hms,
};
