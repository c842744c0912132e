//! Receiver-side congestion control.
//!
//! The strategy owns the receiver window carried in status messages.
//! Resolved once per image at creation and driven from the receiver
//! thread's rebuild tracking.

/// The capability set an image drives.
pub trait CongestionControl: Send {
    /// Window advertised before any feedback.
    fn initial_window_length(&self) -> i32;

    /// Track rebuild progress. Returns `(window, force_status_message)`.
    fn on_track_rebuild(
        &mut self,
        now_ns: i64,
        new_consumption_position: i64,
        hwm_position: i64,
        loss_occurred: bool,
    ) -> (i32, bool);

    /// An RTT measurement completed.
    fn on_rttm(&mut self, now_ns: i64, rtt_ns: i64);

    /// Whether the image should solicit an RTT measurement now.
    fn should_measure_rtt(&mut self, now_ns: i64) -> bool;
}

/// Fixed window; never forces status messages, never measures RTT.
pub struct StaticWindowCongestionControl {
    window_length: i32,
}

impl StaticWindowCongestionControl {
    pub fn new(window_length: i32) -> Self {
        Self { window_length }
    }
}

impl CongestionControl for StaticWindowCongestionControl {
    fn initial_window_length(&self) -> i32 {
        self.window_length
    }

    fn on_track_rebuild(
        &mut self,
        _now_ns: i64,
        _new_consumption_position: i64,
        _hwm_position: i64,
        _loss_occurred: bool,
    ) -> (i32, bool) {
        (self.window_length, false)
    }

    fn on_rttm(&mut self, _now_ns: i64, _rtt_ns: i64) {}

    fn should_measure_rtt(&mut self, _now_ns: i64) -> bool {
        false
    }
}

/// Cubic-style window: multiplicative decrease on loss, cubic growth back
/// toward the pre-loss window, in MTU-sized units.
pub struct CubicCongestionControl {
    mtu: i32,
    min_window: i32,
    max_window: i32,
    /// Current window in MTU units.
    cwnd: f64,
    /// Window before the last loss event, in MTU units.
    w_max: f64,
    /// Time of the last loss event.
    last_loss_ns: i64,
    last_rtt_ns: i64,
    last_rtt_probe_ns: i64,
    rtt_probe_interval_ns: i64,
    last_window: i32,
}

/// Multiplicative decrease factor.
const CUBIC_B: f64 = 0.2;
/// Growth scaling constant.
const CUBIC_C: f64 = 0.4;

impl CubicCongestionControl {
    pub fn new(mtu: i32, initial_window: i32, rtt_probe_interval_ns: i64) -> Self {
        let max_units = (initial_window / mtu).max(2) as f64;
        Self {
            mtu,
            min_window: mtu,
            max_window: initial_window.max(mtu),
            cwnd: max_units,
            w_max: max_units,
            last_loss_ns: 0,
            last_rtt_ns: 100_000, // assume 100us until measured
            last_rtt_probe_ns: 0,
            rtt_probe_interval_ns,
            last_window: initial_window.max(mtu),
        }
    }

    fn window(&self) -> i32 {
        ((self.cwnd * self.mtu as f64) as i32).clamp(self.min_window, self.max_window)
    }

    /// Seconds until the cubic curve re-reaches `w_max`.
    fn k(&self) -> f64 {
        (self.w_max * CUBIC_B / CUBIC_C).cbrt()
    }
}

impl CongestionControl for CubicCongestionControl {
    fn initial_window_length(&self) -> i32 {
        self.window()
    }

    fn on_track_rebuild(
        &mut self,
        now_ns: i64,
        _new_consumption_position: i64,
        _hwm_position: i64,
        loss_occurred: bool,
    ) -> (i32, bool) {
        if loss_occurred {
            self.w_max = self.cwnd;
            self.cwnd = (self.cwnd * (1.0 - CUBIC_B)).max(1.0);
            self.last_loss_ns = now_ns;
        } else {
            let t = (now_ns - self.last_loss_ns) as f64 / 1e9;
            let k = self.k();
            self.cwnd = (CUBIC_C * (t - k).powi(3) + self.w_max)
                .clamp(1.0, (self.max_window / self.mtu) as f64);
        }

        let window = self.window();
        let changed = window != self.last_window;
        self.last_window = window;
        (window, changed)
    }

    fn on_rttm(&mut self, _now_ns: i64, rtt_ns: i64) {
        self.last_rtt_ns = rtt_ns;
    }

    fn should_measure_rtt(&mut self, now_ns: i64) -> bool {
        if now_ns - self.last_rtt_probe_ns >= self.rtt_probe_interval_ns {
            self.last_rtt_probe_ns = now_ns;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_window_never_moves() {
        let mut cc = StaticWindowCongestionControl::new(128 * 1024);
        assert_eq!(cc.initial_window_length(), 128 * 1024);
        let (window, force) = cc.on_track_rebuild(0, 0, 1024, true);
        assert_eq!(window, 128 * 1024);
        assert!(!force);
        assert!(!cc.should_measure_rtt(i64::MAX));
    }

    #[test]
    fn cubic_shrinks_on_loss_and_recovers() {
        let mut cc = CubicCongestionControl::new(1408, 64 * 1408, 1_000_000);
        let initial = cc.initial_window_length();

        let (after_loss, _) = cc.on_track_rebuild(1_000_000_000, 0, 0, true);
        assert!(after_loss < initial, "loss must shrink the window");

        // With a long quiet period the window grows back to the cap.
        let (recovered, _) = cc.on_track_rebuild(100_000_000_000, 0, 0, false);
        assert!(recovered > after_loss);
        assert!(recovered <= initial);
    }

    #[test]
    fn cubic_window_never_below_one_mtu() {
        let mut cc = CubicCongestionControl::new(1408, 4 * 1408, 1_000_000);
        for i in 0..64 {
            cc.on_track_rebuild(i, 0, 0, true);
        }
        let (window, _) = cc.on_track_rebuild(100, 0, 0, true);
        assert!(window >= 1408);
    }

    #[test]
    fn rtt_probe_is_rate_limited() {
        let mut cc = CubicCongestionControl::new(1408, 64 * 1408, 1_000);
        assert!(cc.should_measure_rtt(1_000));
        assert!(!cc.should_measure_rtt(1_500));
        assert!(cc.should_measure_rtt(2_500));
    }
}
