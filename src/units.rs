//! Unit conversions for temperatures and gravities.
//!
//! Internal storage is always Celsius and specific gravity (SG); these
//! conversions run only at the boundaries (ingress payloads and display).

/// Convert Celsius to Fahrenheit.
///
/// # Example
///
/// ```
/// use brewsignal::units::celsius_to_fahrenheit;
///
/// let fahrenheit = celsius_to_fahrenheit(100.0);
/// assert!((fahrenheit - 212.0).abs() < 0.001);
/// ```
#[inline]
pub fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

/// Convert Fahrenheit to Celsius.
///
/// # Example
///
/// ```
/// use brewsignal::units::fahrenheit_to_celsius;
///
/// let celsius = fahrenheit_to_celsius(212.0);
/// assert!((celsius - 100.0).abs() < 0.001);
/// ```
#[inline]
pub fn fahrenheit_to_celsius(fahrenheit: f64) -> f64 {
    (fahrenheit - 32.0) * 5.0 / 9.0
}

/// Convert specific gravity to degrees Plato.
///
/// Standard ASBC cubic approximation, accurate to ±0.02°P over the brewing
/// range.
#[inline]
pub fn sg_to_plato(sg: f64) -> f64 {
    -616.868 + 1111.14 * sg - 630.272 * sg * sg + 135.997 * sg * sg * sg
}

/// Convert degrees Plato to specific gravity.
///
/// Inverse of the ASBC approximation; the rational form below matches
/// [`sg_to_plato`] to well under 0.0002 SG across the brewing range.
#[inline]
pub fn plato_to_sg(plato: f64) -> f64 {
    1.0 + plato / (258.6 - (plato / 258.2) * 227.1)
}

/// Convert specific gravity to degrees Brix.
///
/// Brix and Plato share a scale to within instrument tolerance for wort.
#[inline]
pub fn sg_to_brix(sg: f64) -> f64 {
    sg_to_plato(sg)
}

/// Convert degrees Brix to specific gravity.
#[inline]
pub fn brix_to_sg(brix: f64) -> f64 {
    plato_to_sg(brix)
}
