/* Copyright (c) 2019 University of Utah
 *
 * Permission to use, copy, modify, and distribute this software for any
 * purpose with or without fee is hereby granted, provided that the above
 * copyright notice and this permission notice appear in all copies.
 *
 * THE SOFTWARE IS PROVIDED "AS IS" AND THE AUTHOR(S) DISCLAIM ALL WARRANTIES
 * WITH REGARD TO THIS SOFTWARE INCLUDING ALL IMPLIED WARRANTIES OF
 * MERCHANTABILITY AND FITNESS. IN NO EVENT SHALL AUTHORS BE LIABLE FOR
 * ANY SPECIAL, DIRECT, INDIRECT, OR CONSEQUENTIAL DAMAGES OR ANY DAMAGES
 * WHATSOEVER RESULTING FROM LOSS OF USE, DATA OR PROFITS, WHETHER IN AN
 * ACTION OF CONTRACT, NEGLIGENCE OR OTHER TORTIOUS ACTION, ARISING OUT OF
 * OR IN CONNECTION WITH THE USE OR PERFORMANCE OF THIS SOFTWARE.
 */

//! Inter-arrival / key-size / value-size / key-selector distribution
//! library. The source this is ported from keeps one `rand_gen` struct
//! per distribution with a function-pointer `inv_cdf` or `generate`
//! slot; here each distribution kind is a plain data variant and the
//! sampling logic lives in one place (`Distribution::generate`),
//! matching the "sum type over function pointers" redesign.
//!
//! A `DistKind` is the immutable, `Copy` description of a distribution
//! (this is what the control block holds and workers read). A
//! `Distribution` additionally owns the per-worker mutable generator
//! state (its own RNG, its own round-robin counter) so that concurrent
//! workers never share mutable sampling state even though they may all
//! be sampling from the same configured shape.

use rand::distributions::{Gamma as GammaDist, IndependentSample, Normal};
use rand::{Rng, SeedableRng, XorShiftRng};

use crate::error::{LancetError, Result};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DistKind {
    Fixed(f64),
    RoundRobin { max: u64 },
    Uniform { max: u64 },
    Exponential { lambda: f64 },
    Pareto { loc: f64, scale: f64, shape: f64 },
    Gev { loc: f64, scale: f64, shape: f64 },
    Bimodal { low: f64, high: f64, prob: f64 },
    LogNormal { mu: f64, sigma: f64 },
    Gamma { alpha: f64, beta: f64 },
}

impl DistKind {
    /// Parses the textual spec forms from the component design, plus the
    /// three named production presets (`fb_key`, `fb_ia`, `fb_val`).
    pub fn parse(spec: &str) -> Result<DistKind> {
        let spec = spec.trim();
        if spec == "fb_key" {
            return Ok(DistKind::Gev { loc: 30.7984, scale: 8.20449, shape: 0.078688 });
        }
        if spec == "fb_ia" {
            return Ok(DistKind::Pareto { loc: 0.0, scale: 16.0292, shape: 0.154971 });
        }
        if spec == "fb_val" {
            return Ok(DistKind::Pareto { loc: 15.0, scale: 214.476, shape: 0.348238 });
        }

        let mut parts = spec.split(':');
        let tag = parts.next().ok_or_else(|| bad(spec))?;
        let rest: Vec<&str> = parts.collect();

        let f = |i: usize| -> Result<f64> {
            rest.get(i)
                .ok_or_else(|| bad(spec))?
                .parse::<f64>()
                .map_err(|_| bad(spec))
        };
        let u = |i: usize| -> Result<u64> {
            rest.get(i)
                .ok_or_else(|| bad(spec))?
                .parse::<u64>()
                .map_err(|_| bad(spec))
        };

        match tag {
            "fixed" => Ok(DistKind::Fixed(f(0)?)),
            "rr" => Ok(DistKind::RoundRobin { max: u(0)? }),
            "uni" => Ok(DistKind::Uniform { max: u(0)? }),
            "exp" => Ok(DistKind::Exponential { lambda: 1.0 / f(0)? }),
            "pareto" => Ok(DistKind::Pareto {
                loc: f(0)?,
                scale: f(1)?,
                shape: f(2)?,
            }),
            "gev" => Ok(DistKind::Gev {
                loc: f(0)?,
                scale: f(1)?,
                shape: f(2)?,
            }),
            "bimodal" => Ok(DistKind::Bimodal {
                low: f(0)?,
                high: f(1)?,
                prob: f(2)?,
            }),
            "lognorm" => Ok(DistKind::LogNormal { mu: f(0)?, sigma: f(1)? }),
            "gamma" => Ok(DistKind::Gamma { alpha: f(0)?, beta: f(1)? }),
            _ => Err(bad(spec)),
        }
    }

    /// Only `fixed` and `exp` accept a runtime mean override, matching
    /// `set_avg_ext`'s fatal default case for every other kind.
    pub fn set_avg(&mut self, avg: f64) -> Result<()> {
        match self {
            DistKind::Fixed(v) => {
                *v = avg;
                Ok(())
            }
            DistKind::Exponential { lambda } => {
                *lambda = 1.0 / avg;
                Ok(())
            }
            other => Err(LancetError::Config(format!(
                "set_avg not supported for distribution {:?}",
                other
            ))),
        }
    }
}

fn bad(spec: &str) -> LancetError {
    LancetError::Config(format!("unrecognized distribution spec '{}'", spec))
}

/// Per-worker sampling state built from a `DistKind`.
pub struct Distribution {
    kind: DistKind,
    rng: XorShiftRng,
    rr_next: u64,
}

impl Distribution {
    pub fn new(kind: DistKind, seed: u64) -> Distribution {
        let seed32 = seed as u32;
        let seeds = [
            seed32 | 1,
            (seed32 >> 8) | 1,
            (seed32 >> 16) | 1,
            (seed32 >> 24) | 1,
        ];
        Distribution {
            kind,
            rng: XorShiftRng::from_seed(seeds),
            rr_next: 0,
        }
    }

    /// Re-points this worker's view of the distribution shape at a fresh
    /// `DistKind` without disturbing its own RNG or round-robin counter.
    /// This is how `set_load` propagates from the control block without
    /// giving workers shared mutable sampling state.
    pub fn refresh(&mut self, kind: DistKind) {
        self.kind = kind;
    }

    pub fn kind(&self) -> DistKind {
        self.kind
    }

    pub fn generate(&mut self) -> f64 {
        match self.kind {
            DistKind::Fixed(v) => v,
            DistKind::RoundRobin { max } => {
                let v = self.rr_next % max.max(1);
                self.rr_next += 1;
                v as f64
            }
            DistKind::Uniform { max } => (self.rng.gen::<u64>() % max.max(1)) as f64,
            DistKind::Exponential { lambda } => {
                let y = self.next_unit();
                -y.ln() / lambda
            }
            DistKind::Pareto { loc, scale, shape } => {
                let y = self.next_unit();
                loc + scale * ((1.0 - y).powf(-shape) - 1.0) / shape
            }
            DistKind::Gev { loc, scale, shape } => {
                let y = self.next_unit();
                loc + scale * ((-y.exp()).powf(-shape) - 1.0) / shape
            }
            DistKind::Bimodal { low, high, prob } => {
                let y = self.next_unit();
                if y <= prob {
                    low
                } else {
                    high
                }
            }
            DistKind::LogNormal { mu, sigma } => {
                let normal = Normal::new(mu, sigma);
                normal.ind_sample(&mut self.rng).exp()
            }
            DistKind::Gamma { alpha, beta } => {
                let gamma = GammaDist::new(alpha, beta);
                gamma.ind_sample(&mut self.rng)
            }
        }
    }

    /// Draw used as the `y` input to the inverse-CDF forms; excludes 0 so
    /// `-ln(y)` and `(1-y)^k` never blow up.
    fn next_unit(&mut self) -> f64 {
        loop {
            let y = self.rng.gen::<f64>();
            if y > 0.0 {
                return y;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fixed() {
        assert_eq!(DistKind::parse("fixed:1000").unwrap(), DistKind::Fixed(1000.0));
    }

    #[test]
    fn parses_named_presets() {
        assert!(matches!(DistKind::parse("fb_key").unwrap(), DistKind::Gev { .. }));
        assert!(matches!(DistKind::parse("fb_ia").unwrap(), DistKind::Pareto { .. }));
        assert!(matches!(DistKind::parse("fb_val").unwrap(), DistKind::Pareto { .. }));
    }

    #[test]
    fn rejects_unknown() {
        assert!(DistKind::parse("bogus:1").is_err());
    }

    #[test]
    fn set_avg_only_for_fixed_and_exp() {
        let mut fixed = DistKind::Fixed(10.0);
        fixed.set_avg(20.0).unwrap();
        assert_eq!(fixed, DistKind::Fixed(20.0));

        let mut pareto = DistKind::Pareto { loc: 0.0, scale: 1.0, shape: 1.0 };
        assert!(pareto.set_avg(5.0).is_err());
    }

    #[test]
    fn round_robin_is_sequential_and_wraps() {
        let mut d = Distribution::new(DistKind::RoundRobin { max: 3 }, 1);
        let seq: Vec<u64> = (0..7).map(|_| d.generate() as u64).collect();
        assert_eq!(seq, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn fixed_mean_is_exact() {
        let mut d = Distribution::new(DistKind::Fixed(42.0), 7);
        for _ in 0..100 {
            assert_eq!(d.generate(), 42.0);
        }
    }

    #[test]
    fn exponential_converges_to_configured_mean() {
        let mut kind = DistKind::Exponential { lambda: 1.0 };
        kind.set_avg(1000.0).unwrap();
        let mut d = Distribution::new(kind, 99);
        let n = 200_000;
        let sum: f64 = (0..n).map(|_| d.generate()).sum();
        let mean = sum / n as f64;
        assert!((mean - 1000.0).abs() / 1000.0 < 0.03, "mean was {}", mean);
    }

    #[test]
    fn bimodal_respects_probability_split() {
        let mut d = Distribution::new(
            DistKind::Bimodal { low: 1.0, high: 2.0, prob: 0.25 },
            3,
        );
        let n = 50_000;
        let low_count = (0..n).filter(|_| d.generate() == 1.0).count();
        let frac = low_count as f64 / n as f64;
        assert!((frac - 0.25).abs() < 0.02, "frac was {}", frac);
    }
}
