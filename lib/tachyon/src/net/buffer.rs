use std::io;

/// A buffered FIFO byte queue over fixed storage. Data is appended at the
/// tail and read from the head; the occupied region is compacted to the
/// front whenever a writer needs the trailing space.
pub struct Buffer {
    data: Box<[u8]>,
    head: usize,
    tail: usize,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        Buffer {
            data: vec![0u8; size].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Total storage capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Consume `count` bytes from the front.
    #[inline]
    pub fn move_head(&mut self, count: usize) {
        self.head += count;
        debug_assert!(self.head <= self.tail);

        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
        }
    }

    /// Commit `count` freshly written bytes at the tail.
    #[inline]
    pub fn move_tail(&mut self, count: usize) {
        self.tail += count;
        debug_assert!(self.tail <= self.data.len());
    }

    /// Slice containing data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..self.tail]
    }

    #[inline]
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Slice containing free capacity to be written. Compacts the occupied
    /// region to the front first, so the whole free capacity is contiguous.
    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        if self.head > 0 {
            self.data.copy_within(self.head..self.tail, 0);
            self.tail -= self.head;
            self.head = 0;
        }

        &mut self.data[self.tail..]
    }

    /// Write the contents of the buffer to the supplied writer, advancing
    /// the read offset. A zero-length write is a peer close.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let orig_len = self.len();

        while !self.is_empty() {
            let count = writer.write(self.read_slice())?;

            if count == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }

            self.move_head(count);
        }

        Ok(orig_len - self.len())
    }

    /// Read in data from the supplied reader to the buffer. A zero-length
    /// read is a peer close; filling the buffer without the reader running
    /// dry is an overrun.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let mut total = 0;

        while self.free_capacity() > 0 {
            let count = reader.read(self.write_slice())?;

            if count == 0 {
                if total == 0 {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                return Ok(total);
            }

            self.move_tail(count);
            total += count;
        }

        Err(io::Error::new(io::ErrorKind::Other, "Buffer overrun"))
    }

    /// Mutable slice containing data.
    #[allow(dead_code)]
    #[inline]
    pub(crate) fn data_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.head..self.tail]
    }
}
