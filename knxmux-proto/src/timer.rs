use std::{
    ops::{Index, IndexMut},
    time::Instant,
};

/// Kinds of timeouts needed to run the protocol logic
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub(crate) enum Timer {
    /// When to give up waiting for a connect response
    Connect = 0,
    /// When to resend the in-flight tunneling request or declare it lost
    Ack = 1,
    /// When the next keep-alive probe is due (client role)
    Heartbeat = 2,
    /// When to count the outstanding keep-alive probe as missed
    HeartbeatTimeout = 3,
    /// When to drop a peer that stopped sending keep-alives (server role)
    Idle = 4,
}

impl Timer {
    pub(crate) const VALUES: [Self; 5] = [
        Self::Connect,
        Self::Ack,
        Self::Heartbeat,
        Self::HeartbeatTimeout,
        Self::Idle,
    ];
}

/// A table of data associated with each distinct kind of `Timer`
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct TimerTable {
    data: [Option<Instant>; 5],
}

impl TimerTable {
    pub(crate) fn set(&mut self, timer: Timer, time: Instant) {
        self.data[timer as usize] = Some(time);
    }

    pub(crate) fn get(&self, timer: Timer) -> Option<Instant> {
        self.data[timer as usize]
    }

    pub(crate) fn stop(&mut self, timer: Timer) {
        self.data[timer as usize] = None;
    }

    pub(crate) fn stop_all(&mut self) {
        self.data = [None; 5];
    }

    /// The armed timer that fires soonest, if any
    pub(crate) fn next_timeout(&self) -> Option<Instant> {
        self.data.iter().filter_map(|&x| x).min()
    }

    /// Armed timers whose deadline has passed, in declaration order
    pub(crate) fn expired(&self, now: Instant) -> impl Iterator<Item = Timer> + '_ {
        Timer::VALUES
            .into_iter()
            .filter(move |&timer| self.get(timer).map_or(false, |deadline| deadline <= now))
    }
}

impl Index<Timer> for TimerTable {
    type Output = Option<Instant>;
    fn index(&self, timer: Timer) -> &Option<Instant> {
        &self.data[timer as usize]
    }
}

impl IndexMut<Timer> for TimerTable {
    fn index_mut(&mut self, timer: Timer) -> &mut Option<Instant> {
        &mut self.data[timer as usize]
    }
}
