/*
 * flow.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Staffetta, an HTTP client library.
 *
 * Staffetta is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Staffetta is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Staffetta.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Flow-control windows. Each direction keeps two of these per stream plus
//! one pair at the connection level. A window is a signed byte budget: it
//! goes down as DATA is sent or received, up on WINDOW_UPDATE, and may go
//! negative after an INITIAL_WINDOW_SIZE reduction.

use super::frame::MAX_WINDOW_SIZE;

/// Send-side window: credit granted by the peer.
#[derive(Debug, Clone, Copy)]
pub struct SendWindow {
    window: i64,
}

impl SendWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            window: initial as i64,
        }
    }

    /// Bytes that may be sent right now (zero when the window is negative).
    pub fn available(&self) -> usize {
        self.window.max(0) as usize
    }

    /// Consume credit for bytes about to be written. The caller must not
    /// exceed `available`.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.available());
        self.window -= n as i64;
    }

    /// Credit from a WINDOW_UPDATE. Errs when the window would exceed
    /// 2^31-1, which the peer must treat as FLOW_CONTROL_ERROR.
    pub fn add(&mut self, increment: u32) -> Result<(), ()> {
        let next = self.window + increment as i64;
        if next > MAX_WINDOW_SIZE {
            return Err(());
        }
        self.window = next;
        Ok(())
    }

    /// Retroactive adjustment when the peer changes
    /// SETTINGS_INITIAL_WINDOW_SIZE. The window may go negative; senders
    /// block until enough WINDOW_UPDATE credit arrives.
    pub fn adjust_initial(&mut self, old_initial: u32, new_initial: u32) {
        self.window += new_initial as i64 - old_initial as i64;
    }
}

/// Receive-side window: what we have granted the peer, with the half-full
/// replenish policy.
#[derive(Debug, Clone, Copy)]
pub struct RecvWindow {
    window: i64,
    initial: u32,
}

impl RecvWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            window: initial as i64,
            initial,
        }
    }

    /// Account for received DATA bytes. Errs when the peer overran the
    /// window (FLOW_CONTROL_ERROR: the connection must be closed).
    pub fn on_data(&mut self, n: usize) -> Result<(), ()> {
        self.window -= n as i64;
        if self.window < 0 {
            return Err(());
        }
        Ok(())
    }

    /// Half-full trigger: once the window drops below half its initial
    /// size, top it back up and return the increment to send as a
    /// WINDOW_UPDATE.
    pub fn replenish(&mut self) -> Option<u32> {
        if self.window < (self.initial as i64) / 2 {
            let increment = self.initial as i64 - self.window;
            self.window = self.initial as i64;
            Some(increment as u32)
        } else {
            None
        }
    }

    pub fn available(&self) -> i64 {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_window_consume_and_credit() {
        let mut w = SendWindow::new(100);
        assert_eq!(w.available(), 100);
        w.consume(60);
        assert_eq!(w.available(), 40);
        w.add(30).unwrap();
        assert_eq!(w.available(), 70);
    }

    #[test]
    fn send_window_overflow_rejected() {
        let mut w = SendWindow::new(0x7fff_ffff);
        assert!(w.add(1).is_err());
    }

    #[test]
    fn initial_window_reduction_can_go_negative() {
        let mut w = SendWindow::new(65_535);
        w.consume(40_000);
        w.adjust_initial(65_535, 16_384);
        // 25535 - 49151 < 0: no credit until updates arrive.
        assert_eq!(w.available(), 0);
        w.add(30_000).unwrap();
        assert!(w.available() > 0);
    }

    #[test]
    fn recv_window_detects_overrun() {
        let mut w = RecvWindow::new(10);
        assert!(w.on_data(10).is_ok());
        assert!(w.on_data(1).is_err());
    }

    #[test]
    fn replenish_fires_below_half() {
        let mut w = RecvWindow::new(100);
        w.on_data(49).unwrap();
        assert_eq!(w.replenish(), None);
        w.on_data(2).unwrap();
        assert_eq!(w.replenish(), Some(51));
        assert_eq!(w.available(), 100);
    }

    #[test]
    fn conservation_invariant() {
        // received + window == initial + sum(updates)
        let initial = 65_535u32;
        let mut w = RecvWindow::new(initial);
        let mut received = 0i64;
        let mut updates = 0i64;
        for chunk in [10_000usize, 20_000, 30_000, 5_000, 40_000] {
            w.on_data(chunk).unwrap();
            received += chunk as i64;
            if let Some(inc) = w.replenish() {
                updates += inc as i64;
            }
            assert_eq!(received + w.available(), initial as i64 + updates);
        }
    }
}
