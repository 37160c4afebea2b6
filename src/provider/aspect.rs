use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AspectRatio {
    pub width: u32,
    pub height: u32,
}

impl AspectRatio {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// `width:height` reduced by their greatest common divisor.
    pub fn reduced(width: u32, height: u32) -> Self {
        let divisor = gcd(width, height).max(1);
        Self::new(width / divisor, height / divisor)
    }

    pub fn value(self) -> f64 {
        f64::from(self.width) / f64::from(self.height)
    }

    /// The supported ratio closest to `value`.
    pub fn snap(value: f64, supported: &[AspectRatio]) -> AspectRatio {
        let mut best = SQUARE;
        let mut best_delta = f64::MAX;
        for candidate in supported {
            let delta = (candidate.value() - value).abs();
            if delta < best_delta {
                best = *candidate;
                best_delta = delta;
            }
        }
        best
    }
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidAspectRatio(pub String);

impl fmt::Display for InvalidAspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid aspect ratio '{}', expected W:H, 'auto' or 'match'",
            self.0
        )
    }
}

impl std::error::Error for InvalidAspectRatio {}

impl FromStr for AspectRatio {
    type Err = InvalidAspectRatio;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidAspectRatio(s.to_string());
        let (w, h) = s.trim().split_once(':').ok_or_else(invalid)?;
        let width: u32 = w.trim().parse().map_err(|_| invalid())?;
        let height: u32 = h.trim().parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self::new(width, height))
    }
}

pub const SQUARE: AspectRatio = AspectRatio::new(1, 1);
pub const PORTRAIT_DEFAULT: AspectRatio = AspectRatio::new(3, 4);
pub const LANDSCAPE_DEFAULT: AspectRatio = AspectRatio::new(4, 3);

/// How the caller wants the output framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AspectMode {
    /// Pick a default from the source orientation.
    #[default]
    Auto,
    /// Echo the source's own width:height.
    MatchSource,
    Fixed(AspectRatio),
}

impl FromStr for AspectMode {
    type Err = InvalidAspectRatio;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(AspectMode::Auto),
            "match" | "match_source" | "original" => Ok(AspectMode::MatchSource),
            other => other.parse().map(AspectMode::Fixed),
        }
    }
}

impl AspectMode {
    /// Resolves the mode against the source dimensions and maps the result
    /// onto `supported`.
    pub fn resolve(self, source: Option<(u32, u32)>, supported: &[AspectRatio]) -> AspectRatio {
        let wanted = match (self, source) {
            (AspectMode::Fixed(ratio), _) => ratio,
            (AspectMode::MatchSource, Some((w, h))) if w > 0 && h > 0 => AspectRatio::reduced(w, h),
            (_, Some((w, h))) if h > w => PORTRAIT_DEFAULT,
            (_, Some((w, h))) if w > h => LANDSCAPE_DEFAULT,
            _ => SQUARE,
        };
        if supported.contains(&wanted) {
            wanted
        } else {
            AspectRatio::snap(wanted.value(), supported)
        }
    }
}
