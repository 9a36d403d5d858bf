use rand::Rng;

/// Read access to the bytes that get delivered to a target.
pub trait Input: Clone + Send + Sync + std::fmt::Debug + 'static {
    fn as_bytes(&self) -> &[u8];
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool;

    /// Lowercase hex MD5 of the bytes, used to name and tell inputs apart in reports.
    fn digest(&self) -> String {
        format!("{:x}", md5::compute(self.as_bytes()))
    }
}

/// An owned, contiguous byte sequence that the fuzz loop perturbs in place.
///
/// The buffer never aliases caller memory: every constructor copies. Its size
/// only changes through an explicit reconstruction (`replace` or assigning a
/// new buffer), never through mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct InputBuffer {
    bytes: Vec<u8>,
}

impl InputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }

    /// Copies `len` bytes starting at `ptr` into a new buffer.
    ///
    /// A null `ptr` or a zero `len` yields an empty buffer.
    ///
    /// # Safety
    /// When `ptr` is non-null it must be valid for reads of `len` bytes for the
    /// duration of the call. The buffer keeps no reference to that memory.
    pub unsafe fn from_raw_parts(ptr: *const u8, len: usize) -> Self {
        if ptr.is_null() || len == 0 {
            return Self::new();
        }
        // SAFETY: upheld by the caller, see above.
        let region = unsafe { std::slice::from_raw_parts(ptr, len) };
        Self::from_bytes(region)
    }

    /// Always a valid slice, empty when the buffer holds nothing.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Discards the current content and takes a copy of `bytes`.
    pub fn replace(&mut self, bytes: &[u8]) {
        self.bytes.clear();
        self.bytes.extend_from_slice(bytes);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }

    /// Flips one uniformly chosen bit of one uniformly chosen byte.
    ///
    /// A no-op on an empty buffer. The generator is supplied by the caller so
    /// that a fixed seed replays the exact same sequence of flips; each worker
    /// should own its own generator. The result is not guaranteed to differ
    /// from every earlier state of the buffer, since a later flip may undo an
    /// earlier one.
    pub fn mutate<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        if self.bytes.is_empty() {
            return;
        }
        let byte_index = rng.random_range(0..self.bytes.len());
        let bit_index = rng.random_range(0..8u32);
        self.bytes[byte_index] ^= 1u8 << bit_index;
    }
}

impl Input for InputBuffer {
    fn as_bytes(&self) -> &[u8] {
        InputBuffer::as_bytes(self)
    }
    fn len(&self) -> usize {
        InputBuffer::len(self)
    }
    fn is_empty(&self) -> bool {
        InputBuffer::is_empty(self)
    }
}

impl From<Vec<u8>> for InputBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl From<&[u8]> for InputBuffer {
    fn from(bytes: &[u8]) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<&str> for InputBuffer {
    fn from(text: &str) -> Self {
        Self::from_bytes(text.as_bytes())
    }
}

impl From<String> for InputBuffer {
    fn from(text: String) -> Self {
        Self {
            bytes: text.into_bytes(),
        }
    }
}

impl From<InputBuffer> for Vec<u8> {
    fn from(input: InputBuffer) -> Self {
        input.bytes
    }
}

impl AsRef<[u8]> for InputBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn differing_bits(a: &[u8], b: &[u8]) -> u32 {
        a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
    }

    #[test]
    fn constructors_copy_their_source() {
        let text = InputBuffer::from("AB");
        assert_eq!(text.as_bytes(), b"AB");

        let owned = InputBuffer::from(String::from("xyz"));
        assert_eq!(owned.as_bytes(), b"xyz");

        let mut source = vec![1u8, 2, 3, 4];
        let copied = InputBuffer::from_bytes(&source);
        source[0] = 99;
        assert_eq!(copied.as_bytes(), &[1, 2, 3, 4]);
    }

    #[test]
    fn raw_parts_are_copied_not_aliased() {
        let mut source = vec![10u8, 20, 30];
        let buffer = unsafe { InputBuffer::from_raw_parts(source.as_ptr(), source.len()) };
        source[1] = 0;
        assert_eq!(buffer.as_bytes(), &[10, 20, 30]);

        let from_null = unsafe { InputBuffer::from_raw_parts(std::ptr::null(), 12) };
        assert!(from_null.is_empty());
        let zero_len = unsafe { InputBuffer::from_raw_parts(source.as_ptr(), 0) };
        assert!(zero_len.is_empty());
    }

    #[test]
    fn empty_buffer_exposes_valid_empty_slice() {
        let buffer = InputBuffer::new();
        assert_eq!(buffer.as_bytes(), &[] as &[u8]);
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn mutate_on_empty_buffer_is_noop() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut buffer = InputBuffer::new();
        for _ in 0..10 {
            buffer.mutate(&mut rng);
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn mutate_preserves_size_and_flips_exactly_one_bit() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut buffer = InputBuffer::from(vec![0u8; 32]);
        for _ in 0..200 {
            let before = buffer.clone();
            buffer.mutate(&mut rng);
            assert_eq!(buffer.len(), 32);
            assert_eq!(differing_bits(before.as_bytes(), buffer.as_bytes()), 1);
        }
    }

    #[test]
    fn mutate_single_byte_buffer_stays_single_byte() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut buffer = InputBuffer::from(vec![0xAAu8]);
        buffer.mutate(&mut rng);
        assert_eq!(buffer.len(), 1);
        assert_eq!((buffer.as_bytes()[0] ^ 0xAA).count_ones(), 1);
    }

    #[test]
    fn same_seed_reproduces_same_bytes() {
        let mut first = InputBuffer::from("AAAAAAAAAAAAAAAA");
        let mut second = first.clone();
        let mut rng_a = ChaCha8Rng::seed_from_u64(1234);
        let mut rng_b = ChaCha8Rng::seed_from_u64(1234);
        for _ in 0..50 {
            first.mutate(&mut rng_a);
            second.mutate(&mut rng_b);
        }
        assert_eq!(first, second);
    }

    #[test]
    fn mutating_a_clone_leaves_the_source_untouched() {
        let source = InputBuffer::from("seed data");
        let mut copy = source.clone();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        copy.mutate(&mut rng);
        assert_eq!(source.as_bytes(), b"seed data");
        assert_ne!(copy, source);
    }

    #[test]
    fn clone_from_self_copy_keeps_content() {
        let mut buffer = InputBuffer::from("same");
        let snapshot = buffer.clone();
        buffer.clone_from(&snapshot);
        assert_eq!(buffer.as_bytes(), b"same");
    }

    #[test]
    fn replace_reconstructs_with_new_size() {
        let mut buffer = InputBuffer::from("short");
        buffer.replace(b"a much longer payload");
        assert_eq!(buffer.as_bytes(), b"a much longer payload");
    }

    #[test]
    fn digest_is_md5_hex() {
        let buffer = InputBuffer::from("");
        assert_eq!(buffer.digest(), "d41d8cd98f00b204e9800998ecf8427e");
    }
}
