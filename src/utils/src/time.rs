// Copyright 2025 The xenbe Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// Local wall-clock time with millisecond precision, used to stamp log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalTime {
    /// Seconds in current minute.
    sec: i32,
    /// Minutes in current hour.
    min: i32,
    /// Hours in current day, 24H format.
    hour: i32,
    /// Days in current month.
    mday: i32,
    /// Months since January.
    mon: i32,
    /// Years since 1900.
    year: i32,
    /// Milliseconds in current second.
    msec: i64,
}

impl LocalTime {
    /// Returns the local time for the calling moment.
    pub fn now() -> LocalTime {
        let mut timespec = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `timespec` is a valid, writable timespec.
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut timespec);
        }

        Self::from_timespec(&timespec)
    }

    fn from_timespec(timespec: &libc::timespec) -> LocalTime {
        // SAFETY: all-zero is a valid bit pattern for `libc::tm` (null `tm_zone` included).
        let mut tm: libc::tm = unsafe { std::mem::zeroed() };

        // SAFETY: both pointers reference valid, properly aligned objects for the whole call.
        unsafe {
            libc::localtime_r(&timespec.tv_sec, &mut tm);
        }

        LocalTime {
            sec: tm.tm_sec,
            min: tm.tm_min,
            hour: tm.tm_hour,
            mday: tm.tm_mday,
            mon: tm.tm_mon,
            year: tm.tm_year,
            msec: i64::from(timespec.tv_nsec) / 1_000_000,
        }
    }
}

impl fmt::Display for LocalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{:02}-{:02} {:02}:{:02}:{:02}.{:03}",
            self.year + 1900,
            self.mon + 1,
            self.mday,
            self.hour,
            self.min,
            self.sec,
            self.msec
        )
    }
}
