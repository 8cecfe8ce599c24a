//! The closed set of units an amount claim may carry.
//!
//! Units serialize as short symbols (`"kg"`, `"m"`, `"1"`, …). The sentinel
//! [`AmountUnit::Custom`] (`"@"`) marks amounts whose unit is still reserved
//! for discovery; aggregations filter it out of user-facing facets.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

macro_rules! amount_units {
    ($(($variant:ident, $symbol:literal)),+ $(,)?) => {
        /// A unit of measurement for amount claims. Closed enumeration.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum AmountUnit {
            $($variant,)+
        }

        /// Total number of units, exposed for pre-sizing aggregations.
        pub const AMOUNT_UNITS_TOTAL: usize = [$(AmountUnit::$variant),+].len();

        impl AmountUnit {
            /// The serialized symbol for this unit.
            pub fn symbol(self) -> &'static str {
                match self {
                    $(AmountUnit::$variant => $symbol,)+
                }
            }

            /// All units, in declaration order.
            pub fn all() -> &'static [AmountUnit] {
                const ALL: [AmountUnit; AMOUNT_UNITS_TOTAL] = [$(AmountUnit::$variant),+];
                &ALL
            }
        }

        impl FromStr for AmountUnit {
            type Err = UnknownUnit;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($symbol => Ok(AmountUnit::$variant),)+
                    other => Err(UnknownUnit(other.to_string())),
                }
            }
        }
    };
}

amount_units! {
    (None, ""),
    (Custom, "@"),
    (Ratio, "1"),
    (Kilogram, "kg"),
    (KilogramPerKilogram, "kg/kg"),
    (Metre, "m"),
    (SquareMetre, "m²"),
    (CubicMetre, "m³"),
    (MetrePerSecond, "m/s"),
    (Second, "s"),
    (Litre, "l"),
    (LitrePerLitre, "l/l"),
    (Gram, "g"),
    (GramPerGram, "g/g"),
    (Joule, "J"),
    (Calorie, "cal"),
    (Kelvin, "K"),
    (Celsius, "°C"),
    (Radian, "rad"),
    (Degree, "°"),
    (Watt, "W"),
    (Pascal, "Pa"),
    (Ampere, "A"),
    (Volt, "V"),
    (Ohm, "Ω"),
    (Hertz, "Hz"),
    (Mole, "mol"),
    (Candela, "cd"),
    (Byte, "B"),
}

/// Error for a symbol outside the closed unit set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown amount unit {0:?}")]
pub struct UnknownUnit(pub String);

impl fmt::Display for AmountUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl Serialize for AmountUnit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.symbol())
    }
}

impl<'de> Deserialize<'de> for AmountUnit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbols_round_trip() {
        for unit in AmountUnit::all() {
            let back: AmountUnit = unit.symbol().parse().unwrap();
            assert_eq!(back, *unit);
        }
    }

    #[test]
    fn total_matches_all() {
        assert_eq!(AmountUnit::all().len(), AMOUNT_UNITS_TOTAL);
        assert!(AMOUNT_UNITS_TOTAL >= 20);
    }

    #[test]
    fn serde_uses_symbols() {
        assert_eq!(serde_json::to_string(&AmountUnit::Kilogram).unwrap(), "\"kg\"");
        assert_eq!(serde_json::from_str::<AmountUnit>("\"@\"").unwrap(), AmountUnit::Custom);
        assert!(serde_json::from_str::<AmountUnit>("\"furlong\"").is_err());
    }
}
