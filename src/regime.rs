//! Volatility regime classification
//!
//! Maps a volatility index (VIX-style) onto four ordered regimes and reports
//! transitions edge-triggered: a regime change is reported once, on the first
//! observation in the new band, no matter how many ticks stay in that band.

use serde::{Deserialize, Serialize};

/// Market volatility regime, ordered from calmest to most volatile
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    Calm,
    Normal,
    Elevated,
    High,
}

impl Regime {
    pub const ALL: [Regime; 4] = [Regime::Calm, Regime::Normal, Regime::Elevated, Regime::High];

    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::Calm => "CALM",
            Regime::Normal => "NORMAL",
            Regime::Elevated => "ELEVATED",
            Regime::High => "HIGH",
        }
    }

    pub fn parse(s: &str) -> Option<Regime> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CALM" => Some(Regime::Calm),
            "NORMAL" => Some(Regime::Normal),
            "ELEVATED" => Some(Regime::Elevated),
            "HIGH" => Some(Regime::High),
            _ => None,
        }
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a regime change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Rising,
    Falling,
    Unchanged,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Direction::Rising => "rising",
            Direction::Falling => "falling",
            Direction::Unchanged => "unchanged",
        };
        f.write_str(s)
    }
}

/// Lower bounds of NORMAL, ELEVATED and HIGH.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegimeBreakpoints {
    normal: f64,
    elevated: f64,
    high: f64,
}

impl Default for RegimeBreakpoints {
    fn default() -> Self {
        RegimeBreakpoints {
            normal: 15.0,
            elevated: 20.0,
            high: 30.0,
        }
    }
}

impl RegimeBreakpoints {
    /// Breakpoints must be finite and strictly increasing.
    pub fn new(normal: f64, elevated: f64, high: f64) -> Option<Self> {
        let all_finite = [normal, elevated, high].iter().all(|v| v.is_finite());
        if all_finite && normal < elevated && elevated < high {
            Some(RegimeBreakpoints {
                normal,
                elevated,
                high,
            })
        } else {
            None
        }
    }

    pub fn values(&self) -> [f64; 3] {
        [self.normal, self.elevated, self.high]
    }

    /// Total over the real line. NaN is treated as the calmest reading.
    pub fn classify(&self, volatility_index: f64) -> Regime {
        if volatility_index >= self.high {
            Regime::High
        } else if volatility_index >= self.elevated {
            Regime::Elevated
        } else if volatility_index >= self.normal {
            Regime::Normal
        } else {
            Regime::Calm
        }
    }
}

impl TryFrom<Vec<f64>> for RegimeBreakpoints {
    type Error = String;

    fn try_from(values: Vec<f64>) -> Result<Self, Self::Error> {
        match values.as_slice() {
            [a, b, c] => RegimeBreakpoints::new(*a, *b, *c)
                .ok_or_else(|| format!("breakpoints {:?} must be strictly increasing", values)),
            _ => Err(format!("expected 3 breakpoints, got {}", values.len())),
        }
    }
}

impl From<RegimeBreakpoints> for Vec<f64> {
    fn from(b: RegimeBreakpoints) -> Self {
        b.values().to_vec()
    }
}

/// Classify with the default breakpoints (15 / 20 / 30).
pub fn classify(volatility_index: f64) -> Regime {
    RegimeBreakpoints::default().classify(volatility_index)
}

/// Regime change between two observations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub changed: bool,
    pub direction: Direction,
}

pub fn detect_transition(previous: Regime, current: Regime) -> Transition {
    let direction = match current.cmp(&previous) {
        std::cmp::Ordering::Greater => Direction::Rising,
        std::cmp::Ordering::Less => Direction::Falling,
        std::cmp::Ordering::Equal => Direction::Unchanged,
    };
    Transition {
        changed: direction != Direction::Unchanged,
        direction,
    }
}

/// A regime change observed by the tracker
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeChange {
    pub from: Regime,
    pub to: Regime,
    pub direction: Direction,
    pub volatility_index: f64,
}

/// Remembers the last observed regime so transitions fire once per change.
#[derive(Debug, Clone, Default)]
pub struct RegimeTracker {
    last: Option<Regime>,
}

impl RegimeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from a persisted regime.
    pub fn resume(last: Option<Regime>) -> Self {
        RegimeTracker { last }
    }

    pub fn current(&self) -> Option<Regime> {
        self.last
    }

    /// Record an observation. The first observation only seeds the tracker.
    pub fn observe(&mut self, breakpoints: &RegimeBreakpoints, volatility_index: f64) -> Option<RegimeChange> {
        let regime = breakpoints.classify(volatility_index);
        let previous = self.last.replace(regime)?;

        let transition = detect_transition(previous, regime);
        transition.changed.then_some(RegimeChange {
            from: previous,
            to: regime,
            direction: transition.direction,
            volatility_index,
        })
    }
}
