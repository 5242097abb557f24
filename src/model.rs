//! Fan model catalog.
//!
//! Maps miIO model strings to a cached [`FanModelType`] and the MIoT
//! `(siid, piid)` property address used for speed control. Classification
//! keys on the accepted vendor prefixes and the last three characters of the
//! model string, which is unambiguous across the supported range.

use std::fmt;

/// MIoT property address for power control; identical across all supported
/// fan models.
pub const POWER_SIID: u8 = 2;
/// See [`POWER_SIID`].
pub const POWER_PIID: u8 = 1;

/// Cached fan model classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FanModelType {
    /// Unrecognized model; speed control falls back to `(6, 8)`.
    #[default]
    Unknown,
    /// zhimi.fan.za5 (Smartmi Standing Fan 3).
    ZhimiFanZa5,
    /// zhimi.fan.za4 / za3 (Smartmi Standing Fan 2S).
    ZhimiFanZa4,
    /// zhimi.fan.v2 / v3 (Smartmi Standing Fan 2).
    ZhimiFanV3,
    /// dmaker.fan.1c (Mi Smart Standing Fan 1C); uses discrete fan levels.
    DmakerFan1c,
    /// dmaker.fan.p5.
    DmakerFanP5,
    /// dmaker.fan.p8 / p9.
    DmakerFanP9,
    /// dmaker.fan.p10 / p18.
    DmakerFanP10,
    /// dmaker.fan.p11 / p15 / p30 / p33 / p220.
    DmakerFanP11,
    /// xiaomi.fan.p76.
    XiaomiFanP76,
}

/// Speed-control property address for a fan model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeedParams {
    pub siid: u8,
    pub piid: u8,
    /// When true, percent values map to discrete levels 1..=3 instead of
    /// being sent verbatim.
    pub use_fan_level: bool,
}

impl FanModelType {
    /// Classify a model string by its last three characters.
    ///
    /// Returns `Unknown` for empty or unrecognized strings.
    pub fn from_model(model: &str) -> Self {
        if model.is_empty() {
            return FanModelType::Unknown;
        }
        let bytes = model.as_bytes();
        if bytes.len() < 3 {
            return FanModelType::Unknown;
        }
        let suffix = &bytes[bytes.len() - 3..];
        match suffix {
            b"za5" => FanModelType::ZhimiFanZa5,
            b"za4" | b"za3" => FanModelType::ZhimiFanZa4,
            b".v2" | b".v3" => FanModelType::ZhimiFanV3,
            b".1c" => FanModelType::DmakerFan1c,
            b".p5" => FanModelType::DmakerFanP5,
            b".p8" | b".p9" => FanModelType::DmakerFanP9,
            b"p10" | b"p18" => FanModelType::DmakerFanP10,
            b"p11" | b"p15" | b"p30" | b"p33" | b"220" => FanModelType::DmakerFanP11,
            b"p76" => FanModelType::XiaomiFanP76,
            _ => FanModelType::Unknown,
        }
    }

    /// The speed-control property address for this model.
    pub fn speed_params(&self) -> SpeedParams {
        match self {
            FanModelType::DmakerFan1c => SpeedParams {
                siid: 2,
                piid: 2,
                use_fan_level: true,
            },
            FanModelType::DmakerFanP9 => SpeedParams {
                siid: 2,
                piid: 11,
                use_fan_level: false,
            },
            FanModelType::DmakerFanP10 => SpeedParams {
                siid: 2,
                piid: 10,
                use_fan_level: false,
            },
            FanModelType::DmakerFanP5 | FanModelType::DmakerFanP11 => SpeedParams {
                siid: 2,
                piid: 6,
                use_fan_level: false,
            },
            FanModelType::XiaomiFanP76 => SpeedParams {
                siid: 2,
                piid: 5,
                use_fan_level: false,
            },
            FanModelType::ZhimiFanZa5
            | FanModelType::ZhimiFanZa4
            | FanModelType::ZhimiFanV3
            | FanModelType::Unknown => SpeedParams {
                siid: 6,
                piid: 8,
                use_fan_level: false,
            },
        }
    }

    /// A representative model string for this type.
    pub fn canonical_model(&self) -> &'static str {
        match self {
            FanModelType::Unknown => "",
            FanModelType::ZhimiFanZa5 => "zhimi.fan.za5",
            FanModelType::ZhimiFanZa4 => "zhimi.fan.za4",
            FanModelType::ZhimiFanV3 => "zhimi.fan.v3",
            FanModelType::DmakerFan1c => "dmaker.fan.1c",
            FanModelType::DmakerFanP5 => "dmaker.fan.p5",
            FanModelType::DmakerFanP9 => "dmaker.fan.p9",
            FanModelType::DmakerFanP10 => "dmaker.fan.p10",
            FanModelType::DmakerFanP11 => "dmaker.fan.p11",
            FanModelType::XiaomiFanP76 => "xiaomi.fan.p76",
        }
    }
}

impl fmt::Display for FanModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical_model())
    }
}

/// Whether a model string belongs to a supported fan family.
///
/// All supported models carry one of these vendor prefixes; discovery probes
/// use this to reject non-fan miIO devices answering on the same port.
pub fn is_supported_model(model: &str) -> bool {
    model.starts_with("zhimi.fan.")
        || model.starts_with("dmaker.fan.")
        || model.starts_with("xiaomi.fan.")
}

/// Map a speed percent to a discrete fan level for `use_fan_level` models.
///
/// 1..=33 maps to 1, 34..=66 to 2, 67..=100 to 3. The input is expected to
/// be pre-clamped to 1..=100.
pub fn fan_level_for_percent(percent: u8) -> u8 {
    if percent > 66 {
        3
    } else if percent > 33 {
        2
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_classification_table() {
        let cases = [
            ("zhimi.fan.za5", FanModelType::ZhimiFanZa5),
            ("zhimi.fan.za4", FanModelType::ZhimiFanZa4),
            ("zhimi.fan.za3", FanModelType::ZhimiFanZa4),
            ("zhimi.fan.v2", FanModelType::ZhimiFanV3),
            ("zhimi.fan.v3", FanModelType::ZhimiFanV3),
            ("dmaker.fan.1c", FanModelType::DmakerFan1c),
            ("dmaker.fan.p5", FanModelType::DmakerFanP5),
            ("dmaker.fan.p8", FanModelType::DmakerFanP9),
            ("dmaker.fan.p9", FanModelType::DmakerFanP9),
            ("dmaker.fan.p10", FanModelType::DmakerFanP10),
            ("dmaker.fan.p18", FanModelType::DmakerFanP10),
            ("dmaker.fan.p11", FanModelType::DmakerFanP11),
            ("dmaker.fan.p15", FanModelType::DmakerFanP11),
            ("dmaker.fan.p30", FanModelType::DmakerFanP11),
            ("dmaker.fan.p33", FanModelType::DmakerFanP11),
            ("dmaker.fan.p220", FanModelType::DmakerFanP11),
            ("xiaomi.fan.p76", FanModelType::XiaomiFanP76),
            ("some.other.dev", FanModelType::Unknown),
            ("", FanModelType::Unknown),
        ];
        for (model, expected) in cases {
            assert_eq!(FanModelType::from_model(model), expected, "{}", model);
        }
    }

    #[test]
    fn test_speed_params_table() {
        let cases = [
            (FanModelType::ZhimiFanZa5, (6, 8, false)),
            (FanModelType::ZhimiFanZa4, (6, 8, false)),
            (FanModelType::ZhimiFanV3, (6, 8, false)),
            (FanModelType::DmakerFan1c, (2, 2, true)),
            (FanModelType::DmakerFanP5, (2, 6, false)),
            (FanModelType::DmakerFanP9, (2, 11, false)),
            (FanModelType::DmakerFanP10, (2, 10, false)),
            (FanModelType::DmakerFanP11, (2, 6, false)),
            (FanModelType::XiaomiFanP76, (2, 5, false)),
            (FanModelType::Unknown, (6, 8, false)),
        ];
        for (model_type, (siid, piid, level)) in cases {
            let params = model_type.speed_params();
            assert_eq!(params.siid, siid, "{:?}", model_type);
            assert_eq!(params.piid, piid, "{:?}", model_type);
            assert_eq!(params.use_fan_level, level, "{:?}", model_type);
        }
    }

    #[test]
    fn test_canonical_model_round_trips() {
        let all = [
            FanModelType::ZhimiFanZa5,
            FanModelType::ZhimiFanZa4,
            FanModelType::ZhimiFanV3,
            FanModelType::DmakerFan1c,
            FanModelType::DmakerFanP5,
            FanModelType::DmakerFanP9,
            FanModelType::DmakerFanP10,
            FanModelType::DmakerFanP11,
            FanModelType::XiaomiFanP76,
        ];
        for model_type in all {
            assert_eq!(
                FanModelType::from_model(model_type.canonical_model()),
                model_type
            );
        }
    }

    #[test]
    fn test_fan_level_tri_split_is_monotonic() {
        assert_eq!(fan_level_for_percent(1), 1);
        assert_eq!(fan_level_for_percent(33), 1);
        assert_eq!(fan_level_for_percent(34), 2);
        assert_eq!(fan_level_for_percent(45), 2);
        assert_eq!(fan_level_for_percent(66), 2);
        assert_eq!(fan_level_for_percent(67), 3);
        assert_eq!(fan_level_for_percent(100), 3);

        let mut last = 0;
        for p in 1..=100u8 {
            let level = fan_level_for_percent(p);
            assert!((1..=3).contains(&level));
            assert!(level >= last);
            last = level;
        }
    }

    #[test]
    fn test_supported_model_prefixes() {
        assert!(is_supported_model("zhimi.fan.za5"));
        assert!(is_supported_model("dmaker.fan.p11"));
        assert!(is_supported_model("xiaomi.fan.p76"));
        assert!(!is_supported_model("zhimi.humidifier.ca1"));
        assert!(!is_supported_model(""));
    }
}
