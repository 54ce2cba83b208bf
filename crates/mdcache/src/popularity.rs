//! Decaying load counters used by the balancer to estimate inode popularity.

use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

/// Exponential decay rate derived from a half life.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DecayRate {
    k: f64,
}

impl DecayRate {
    /// Rate with the given half life in seconds.
    pub fn new(half_life_secs: f64) -> Self {
        Self {
            k: std::f64::consts::LN_2 / half_life_secs,
        }
    }

    fn factor(&self, elapsed_secs: f64) -> f64 {
        (-self.k * elapsed_secs).exp()
    }
}

/// A counter whose value halves every half life.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DecayCounter {
    value: f64,
    last_decay: Timestamp,
}

impl DecayCounter {
    /// An empty counter anchored at `now`.
    pub fn new(now: Timestamp) -> Self {
        Self {
            value: 0.0,
            last_decay: now,
        }
    }

    fn decay(&mut self, now: Timestamp, rate: &DecayRate) {
        if now > self.last_decay {
            self.value *= rate.factor(now.secs_since(self.last_decay));
            self.last_decay = now;
        }
    }

    /// Decayed value at `now`.
    pub fn get(&mut self, now: Timestamp, rate: &DecayRate) -> f64 {
        self.decay(now, rate);
        self.value
    }

    /// Adds `amount` at `now`.
    pub fn hit(&mut self, now: Timestamp, rate: &DecayRate, amount: f64) -> f64 {
        self.decay(now, rate);
        self.value += amount;
        self.value
    }

    /// Adds another counter's decayed value.
    pub fn add(&mut self, other: &DecayCounter, now: Timestamp, rate: &DecayRate) {
        let mut other = *other;
        self.decay(now, rate);
        self.value += other.get(now, rate);
    }

    /// Subtracts another counter's decayed value, saturating at zero.
    pub fn sub(&mut self, other: &DecayCounter, now: Timestamp, rate: &DecayRate) {
        let mut other = *other;
        self.decay(now, rate);
        self.value = (self.value - other.get(now, rate)).max(0.0);
    }

    /// Moves the whole decayed value out, leaving zero.
    pub fn take(&mut self, now: Timestamp, rate: &DecayRate) -> DecayCounter {
        self.decay(now, rate);
        let out = *self;
        self.value = 0.0;
        out
    }
}

/// Which slice of load a counter accounts for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PopClass {
    /// Load on this inode alone.
    JustMe,
    /// Load within the current authority domain.
    CurDom,
    /// Load from any domain.
    AnyDom,
    /// Load of the nested subtree.
    Nested,
}

impl PopClass {
    const COUNT: usize = 4;

    fn index(self) -> usize {
        match self {
            PopClass::JustMe => 0,
            PopClass::CurDom => 1,
            PopClass::AnyDom => 2,
            PopClass::Nested => 3,
        }
    }
}

/// Per-class popularity counters of one inode.
#[derive(Clone, Debug)]
pub struct Popularity {
    rate: DecayRate,
    counters: [DecayCounter; PopClass::COUNT],
}

impl Popularity {
    /// Zeroed counters decaying with `half_life_secs`.
    pub fn new(half_life_secs: f64) -> Self {
        Self {
            rate: DecayRate::new(half_life_secs),
            counters: [DecayCounter::default(); PopClass::COUNT],
        }
    }

    /// Records one access of the inode at `now` in every class.
    pub fn hit(&mut self, now: Timestamp) {
        let rate = self.rate;
        for c in self.counters.iter_mut() {
            c.hit(now, &rate, 1.0);
        }
    }

    /// Decayed value of `class` at `now`.
    pub fn get(&mut self, class: PopClass, now: Timestamp) -> f64 {
        let rate = self.rate;
        self.counters[class.index()].get(now, &rate)
    }

    /// Moves the value of `class` out.
    pub fn take(&mut self, class: PopClass, now: Timestamp) -> DecayCounter {
        let rate = self.rate;
        self.counters[class.index()].take(now, &rate)
    }

    /// Adds `delta` to `class`.
    pub fn add(&mut self, class: PopClass, delta: &DecayCounter, now: Timestamp) {
        let rate = self.rate;
        self.counters[class.index()].add(delta, now, &rate);
    }

    /// Subtracts `delta` from `class`.
    pub fn sub(&mut self, class: PopClass, delta: &DecayCounter, now: Timestamp) {
        let rate = self.rate;
        self.counters[class.index()].sub(delta, now, &rate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_half_life() {
        let rate = DecayRate::new(5.0);
        let t0 = Timestamp::from_secs(100);
        let mut c = DecayCounter::new(t0);
        c.hit(t0, &rate, 8.0);
        let v = c.get(t0.plus_secs(5), &rate);
        assert!((v - 4.0).abs() < 1e-9);
        let v = c.get(t0.plus_secs(15), &rate);
        assert!((v - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_take_moves_value() {
        let rate = DecayRate::new(5.0);
        let t0 = Timestamp::from_secs(10);
        let mut c = DecayCounter::new(t0);
        c.hit(t0, &rate, 3.0);
        let taken = c.take(t0, &rate);
        assert_eq!(c.get(t0, &rate), 0.0);
        let mut other = DecayCounter::new(t0);
        other.add(&taken, t0, &rate);
        assert_eq!(other.get(t0, &rate), 3.0);
    }

    #[test]
    fn test_sub_saturates() {
        let rate = DecayRate::new(1.0);
        let t0 = Timestamp::from_secs(1);
        let mut a = DecayCounter::new(t0);
        let mut b = DecayCounter::new(t0);
        a.hit(t0, &rate, 1.0);
        b.hit(t0, &rate, 2.0);
        a.sub(&b, t0, &rate);
        assert_eq!(a.get(t0, &rate), 0.0);
    }

    #[test]
    fn test_popularity_classes_independent() {
        let t0 = Timestamp::from_secs(50);
        let mut pop = Popularity::new(5.0);
        pop.hit(t0);
        pop.hit(t0);
        let curdom = pop.take(PopClass::CurDom, t0);
        pop.sub(PopClass::AnyDom, &curdom, t0);
        assert_eq!(pop.get(PopClass::JustMe, t0), 2.0);
        assert_eq!(pop.get(PopClass::CurDom, t0), 0.0);
        assert_eq!(pop.get(PopClass::AnyDom, t0), 0.0);
        assert_eq!(pop.get(PopClass::Nested, t0), 2.0);
    }
}
