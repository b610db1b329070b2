use rand::Rng;
use std::ops::Range;
#[cfg(test)] use std::sync::Mutex;


#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

/// Source of the random start offsets used when scanning peer lists, so that load spreads
///  across equivalent peers instead of piling onto the first one.
#[cfg_attr(test, mockall::automock)]
pub trait Random {
    fn gen_usize_range(range: Range<usize>) -> usize;
}
pub struct RngRandom {}
impl Random for RngRandom {
    fn gen_usize_range(range: Range<usize>) -> usize {
        rand::thread_rng().gen_range(range)
    }
}

/// picks a random start offset for scanning a list of `len` elements
pub fn start_offset<R: Random>(len: usize) -> usize {
    if len <= 1 {
        0
    }
    else {
        R::gen_usize_range(0..len)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_start_offset_trivial_lists() {
        // no expectation is registered, so any call to the mock would panic
        let _lock = MOCK_RANDOM_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        assert_eq!(start_offset::<MockRandom>(0), 0);
        assert_eq!(start_offset::<MockRandom>(1), 0);
    }

    #[test]
    fn test_start_offset_uses_random() {
        let _lock = MOCK_RANDOM_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let ctx = MockRandom::gen_usize_range_context();
        ctx.expect()
            .withf(|r| r == &(0..5))
            .return_const(3usize);
        assert_eq!(start_offset::<MockRandom>(5), 3);
    }

    #[test]
    fn test_rng_random_in_range() {
        for _ in 0..100 {
            assert!(RngRandom::gen_usize_range(2..4) < 4);
        }
    }
}
