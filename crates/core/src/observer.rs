//! Moving-average min/max observers for activation ranges.
//!
//! # Thread safety
//!
//! State sits behind a [`parking_lot::Mutex`] so observers can be updated
//! through `&self` from the data-parallel shards.

use parking_lot::Mutex;

use candle_core::{Result, Tensor};

use crate::quantize::{choose_qparams, QuantParams};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct ObserverState {
    range: Option<(f32, f32)>,
    enabled: bool,
}

/// Tracks an exponential moving average of a tensor's min and max.
///
/// The first observation sets the range directly; later ones move it by
/// `averaging_constant` towards the batch extrema.
#[derive(Debug)]
pub struct MinMaxObserver {
    state: Mutex<ObserverState>,
    averaging_constant: f32,
    qmin: i32,
    qmax: i32,
    symmetric: bool,
}

impl MinMaxObserver {
    pub fn new(averaging_constant: f64, qmin: i32, qmax: i32, symmetric: bool) -> Self {
        Self {
            state: Mutex::new(ObserverState {
                range: None,
                enabled: true,
            }),
            averaging_constant: averaging_constant as f32,
            qmin,
            qmax,
            symmetric,
        }
    }

    pub fn observe(&self, x: &Tensor) -> Result<()> {
        if !self.state.lock().enabled {
            return Ok(());
        }
        let flat = x.detach().flatten_all()?;
        let lo = flat.min(0)?.to_scalar::<f32>()?;
        let hi = flat.max(0)?.to_scalar::<f32>()?;
        let mut state = self.state.lock();
        let c = self.averaging_constant;
        state.range = Some(match state.range {
            None => (lo, hi),
            Some((min, max)) => (min + c * (lo - min), max + c * (hi - max)),
        });
        Ok(())
    }

    /// Stop (or resume) range updates; the current range is kept.
    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub fn range(&self) -> Option<(f32, f32)> {
        self.state.lock().range
    }

    pub fn is_empty(&self) -> bool {
        self.range().is_none()
    }

    /// Per-tensor parameters for the observed range, `None` before the
    /// first observation.
    pub fn qparams(&self) -> Option<QuantParams> {
        let (min, max) = self.range()?;
        let (scale, zp) = choose_qparams(min, max, self.qmin, self.qmax, self.symmetric);
        Some(QuantParams::per_tensor(scale, zp, self.qmin, self.qmax))
    }
}

impl Clone for MinMaxObserver {
    fn clone(&self) -> Self {
        Self {
            state: Mutex::new(*self.state.lock()),
            averaging_constant: self.averaging_constant,
            qmin: self.qmin,
            qmax: self.qmax,
            symmetric: self.symmetric,
        }
    }
}
