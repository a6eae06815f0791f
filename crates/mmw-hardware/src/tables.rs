//! Discrete setting tables.
//!
//! Most front-panel settings are selected by index into a fixed, ascending
//! list of values. A [`SettingTable`] maps both ways and implements the two
//! rounding policies drivers need.

/// An ascending list of instrument-supported values; the position is the index
/// sent on the wire.
#[derive(Debug, Clone, Copy)]
pub struct SettingTable {
    name: &'static str,
    values: &'static [f64],
}

impl SettingTable {
    /// Wrap a table. `values` must be non-empty and strictly ascending.
    pub const fn new(name: &'static str, values: &'static [f64]) -> Self {
        Self { name, values }
    }

    /// Setting name, for log lines.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// `true` if the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value at `index`.
    pub fn value(&self, index: usize) -> Option<f64> {
        self.values.get(index).copied()
    }

    /// Index of an exactly tabulated value.
    pub fn index_of(&self, value: f64) -> Option<usize> {
        self.values
            .iter()
            .position(|&v| (v - value).abs() <= v.abs() * 1e-9)
    }

    /// First entry greater than or equal to `requested`, else the largest entry.
    pub fn at_least(&self, requested: f64) -> usize {
        self.values
            .iter()
            .position(|&v| v >= requested)
            .unwrap_or_else(|| self.values.len().saturating_sub(1))
    }

    /// Last entry less than or equal to `requested`, else the smallest entry.
    pub fn at_most(&self, requested: f64) -> usize {
        self.values
            .iter()
            .rposition(|&v| v <= requested)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SLOPES: SettingTable = SettingTable::new("slope", &[6.0, 12.0, 18.0, 24.0]);

    #[test]
    fn at_least_rounds_up_and_saturates() {
        assert_eq!(SLOPES.at_least(6.0), 0);
        assert_eq!(SLOPES.at_least(7.0), 1);
        assert_eq!(SLOPES.at_least(0.0), 0);
        assert_eq!(SLOPES.at_least(100.0), 3);
    }

    #[test]
    fn at_most_rounds_down_and_defaults_low() {
        assert_eq!(SLOPES.at_most(24.0), 3);
        assert_eq!(SLOPES.at_most(17.9), 1);
        assert_eq!(SLOPES.at_most(1.0), 0);
    }

    #[test]
    fn exact_lookup_is_bidirectional() {
        for index in 0..SLOPES.len() {
            let value = SLOPES.value(index).unwrap_or_default();
            assert_eq!(SLOPES.index_of(value), Some(index));
        }
        assert_eq!(SLOPES.index_of(13.0), None);
        assert_eq!(SLOPES.value(4), None);
    }
}
