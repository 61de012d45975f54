//! Generator of short collision-resistant tokens, used for inbox subjects
//! and request correlation.
//!
//! A token is 22 characters: a 12 character random prefix followed by a
//! 10 character base-62 counter. The counter moves by a randomized step so
//! concurrent observers cannot predict the next token; when it overflows
//! the prefix is re-seeded entirely.
//!
//! The global accessor is a thread-local generator, not a locked
//! process-global one: each thread carries its own random prefix, which
//! keeps cross-thread collisions statistically negligible with no
//! synchronization on the token hot path.

use rand::{thread_rng, Rng};
use std::cell::RefCell;

const DIGITS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const BASE: u64 = 62;
const PREFIX_LEN: usize = 12;
const SEQ_LEN: usize = 10;
/// 62^10, the first counter value that no longer fits in `SEQ_LEN` digits.
const MAX_SEQ: u64 = 839_299_365_868_340_224;
const MIN_INC: u64 = 33;
const MAX_INC: u64 = 333;

/// Total length of a generated token.
pub const TOKEN_LEN: usize = PREFIX_LEN + SEQ_LEN;

#[derive(Debug)]
pub struct Nuid {
    prefix: [u8; PREFIX_LEN],
    seq: u64,
    inc: u64,
}

impl Nuid {
    pub fn new() -> Self {
        let mut nuid = Nuid {
            prefix: [0; PREFIX_LEN],
            seq: 0,
            inc: 0,
        };
        nuid.reseed();
        nuid
    }

    fn reseed(&mut self) {
        let mut rng = thread_rng();
        for b in self.prefix.iter_mut() {
            *b = DIGITS[rng.gen_range(0, BASE as usize)];
        }
        self.seq = rng.gen_range(0, MAX_SEQ / 2);
        self.inc = rng.gen_range(MIN_INC, MAX_INC);
    }

    pub fn next(&mut self) -> String {
        self.seq += self.inc;
        if self.seq >= MAX_SEQ {
            self.reseed();
        }

        let mut out = Vec::with_capacity(TOKEN_LEN);
        out.extend_from_slice(&self.prefix);

        let mut tail = [DIGITS[0]; SEQ_LEN];
        let mut n = self.seq;
        for slot in tail.iter_mut().rev() {
            *slot = DIGITS[(n % BASE) as usize];
            n /= BASE;
        }
        out.extend_from_slice(&tail);

        // This unwrap is safe because every byte comes from DIGITS
        String::from_utf8(out).unwrap()
    }
}

impl Default for Nuid {
    fn default() -> Self {
        Nuid::new()
    }
}

thread_local! {
    static GLOBAL_NUID: RefCell<Nuid> = RefCell::new(Nuid::new());
}

/// Next token from the thread-local generator.
pub fn next() -> String {
    GLOBAL_NUID.with(|nuid| nuid.borrow_mut().next())
}
