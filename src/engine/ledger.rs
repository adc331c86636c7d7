use super::EngineError;

/// Seat accounting for one session. Only ever touched under the session's
/// write lock, so check-and-increment in `try_admit` is linearizable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seats {
    capacity: u32,
    enrolled: u32,
}

impl Seats {
    pub fn new(capacity: u32) -> Self {
        Self { capacity, enrolled: 0 }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn enrolled(&self) -> u32 {
        self.enrolled
    }

    pub fn free(&self) -> u32 {
        self.capacity.saturating_sub(self.enrolled)
    }

    pub fn has_free(&self) -> bool {
        self.enrolled < self.capacity
    }

    /// Take a seat if one is free. Never admits past capacity.
    pub fn try_admit(&mut self) -> bool {
        if self.enrolled < self.capacity {
            self.enrolled += 1;
            true
        } else {
            false
        }
    }

    /// Give a seat back, floored at zero.
    pub fn release(&mut self) {
        self.enrolled = self.enrolled.saturating_sub(1);
    }

    pub fn set_capacity(&mut self, capacity: u32) -> Result<(), EngineError> {
        if capacity == 0 {
            return Err(EngineError::LimitExceeded("capacity must be positive"));
        }
        if capacity < self.enrolled {
            return Err(EngineError::CapacityBelowEnrolled {
                capacity,
                enrolled: self.enrolled,
            });
        }
        self.capacity = capacity;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admit_stops_at_capacity() {
        let mut seats = Seats::new(2);
        assert!(seats.try_admit());
        assert!(seats.try_admit());
        assert!(!seats.try_admit());
        assert_eq!(seats.enrolled(), 2);
        assert_eq!(seats.free(), 0);
    }

    #[test]
    fn release_is_floored() {
        let mut seats = Seats::new(1);
        seats.release();
        assert_eq!(seats.enrolled(), 0);
        assert!(seats.try_admit());
        seats.release();
        seats.release();
        assert_eq!(seats.enrolled(), 0);
    }

    #[test]
    fn shrinking_below_enrolled_rejected() {
        let mut seats = Seats::new(3);
        seats.try_admit();
        seats.try_admit();
        assert_eq!(
            seats.set_capacity(1),
            Err(EngineError::CapacityBelowEnrolled { capacity: 1, enrolled: 2 })
        );
        assert!(seats.set_capacity(2).is_ok());
        assert!(!seats.has_free());
        assert!(seats.set_capacity(0).is_err());
    }
}
