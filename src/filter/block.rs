//! 单个包内的位块（MIXED 状态的 block 才分配）

use byteorder::{ByteOrder, LittleEndian};

use crate::common::{OlapError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitBlock {
    words: Vec<u64>,
    /// 块内有效位数（最后一个块可能不满）
    len:   u32,
    ones:  u32,
}

impl BitBlock {
    pub fn empty(len: u32) -> Self {
        Self { words: vec![0; words_for(len)], len, ones: 0 }
    }

    pub fn full(len: u32) -> Self {
        let mut b = Self { words: vec![u64::MAX; words_for(len)], len, ones: len };
        b.clear_tail();
        b
    }

    #[inline] pub fn len(&self)  -> u32 { self.len }
    #[inline] pub fn ones(&self) -> u32 { self.ones }
    #[inline] pub fn is_empty(&self) -> bool { self.ones == 0 }
    #[inline] pub fn is_full(&self)  -> bool { self.ones == self.len }

    /// 位表占用的字节数
    #[inline] pub fn byte_size(&self) -> u64 { self.words.len() as u64 * 8 }

    #[inline]
    pub fn get(&self, n: u32) -> bool {
        debug_assert!(n < self.len);
        self.words[(n >> 6) as usize] & (1u64 << (n & 63)) != 0
    }

    /// 返回 true 表示位发生了变化
    #[inline]
    pub fn set(&mut self, n: u32) -> bool {
        debug_assert!(n < self.len);
        let w = &mut self.words[(n >> 6) as usize];
        let mask = 1u64 << (n & 63);
        if *w & mask == 0 {
            *w |= mask;
            self.ones += 1;
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn reset(&mut self, n: u32) -> bool {
        debug_assert!(n < self.len);
        let w = &mut self.words[(n >> 6) as usize];
        let mask = 1u64 << (n & 63);
        if *w & mask != 0 {
            *w &= !mask;
            self.ones -= 1;
            true
        } else {
            false
        }
    }

    /// [n1, n2] 闭区间置 1
    pub fn set_range(&mut self, n1: u32, n2: u32) {
        self.apply_range(n1, n2, |w, m| *w |= m);
    }

    /// [n1, n2] 闭区间置 0
    pub fn reset_range(&mut self, n1: u32, n2: u32) {
        self.apply_range(n1, n2, |w, m| *w &= !m);
    }

    fn apply_range(&mut self, n1: u32, n2: u32, op: impl Fn(&mut u64, u64)) {
        debug_assert!(n1 <= n2 && n2 < self.len);
        let (w1, w2) = ((n1 >> 6) as usize, (n2 >> 6) as usize);
        for wi in w1..=w2 {
            let lo = if wi == w1 { n1 & 63 } else { 0 };
            let hi = if wi == w2 { n2 & 63 } else { 63 };
            op(&mut self.words[wi], range_mask(lo, hi));
        }
        self.recount();
    }

    /// [n1, n2] 闭区间内 1 的个数
    pub fn count_between(&self, n1: u32, n2: u32) -> u32 {
        debug_assert!(n1 <= n2 && n2 < self.len);
        let (w1, w2) = ((n1 >> 6) as usize, (n2 >> 6) as usize);
        (w1..=w2)
            .map(|wi| {
                let lo = if wi == w1 { n1 & 63 } else { 0 };
                let hi = if wi == w2 { n2 & 63 } else { 63 };
                (self.words[wi] & range_mask(lo, hi)).count_ones()
            })
            .sum()
    }

    /// 位置 >= from 的第一个 1
    pub fn next_one(&self, from: u32) -> Option<u32> {
        if from >= self.len {
            return None;
        }
        let mut wi = (from >> 6) as usize;
        let mut w  = self.words[wi] & (u64::MAX << (from & 63));
        loop {
            if w != 0 {
                let n = (wi as u32) * 64 + w.trailing_zeros();
                return (n < self.len).then_some(n);
            }
            wi += 1;
            if wi >= self.words.len() {
                return None;
            }
            w = self.words[wi];
        }
    }

    pub fn and(&mut self, other: &BitBlock) {
        self.words.iter_mut().zip(&other.words).for_each(|(a, b)| *a &= *b);
        self.recount();
    }

    pub fn or(&mut self, other: &BitBlock) {
        self.words.iter_mut().zip(&other.words).for_each(|(a, b)| *a |= *b);
        self.recount();
    }

    pub fn and_not(&mut self, other: &BitBlock) {
        self.words.iter_mut().zip(&other.words).for_each(|(a, b)| *a &= !*b);
        self.recount();
    }

    pub fn not(&mut self) {
        self.words.iter_mut().for_each(|w| *w = !*w);
        self.clear_tail();
        self.ones = self.len - self.ones;
    }

    // ── 序列化（换出到 block cache）──────────────────────────────────────────

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.words.len() * 8];
        LittleEndian::write_u64_into(&self.words, &mut out);
        out
    }

    pub fn from_bytes(len: u32, data: &[u8]) -> Result<Self> {
        let n = words_for(len);
        if data.len() != n * 8 {
            return Err(OlapError::Corrupted(format!(
                "bit block of {len} bits needs {} bytes, got {}", n * 8, data.len()
            )));
        }
        let mut words = vec![0u64; n];
        LittleEndian::read_u64_into(data, &mut words);
        let mut b = Self { words, len, ones: 0 };
        b.clear_tail();
        b.recount();
        Ok(b)
    }

    fn recount(&mut self) {
        self.ones = self.words.iter().map(|w| w.count_ones()).sum();
    }

    fn clear_tail(&mut self) {
        let tail = self.len & 63;
        if tail != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << tail) - 1;
            }
        }
    }
}

#[inline]
fn words_for(len: u32) -> usize { ((len as usize) + 63) / 64 }

#[inline]
fn range_mask(lo: u32, hi: u32) -> u64 {
    let upper = if hi == 63 { u64::MAX } else { (1u64 << (hi + 1)) - 1 };
    upper & (u64::MAX << lo)
}
