//! Data Stream
//!
//! Byte buffer for building and parsing packets. Writers append fixed-width
//! values and hand back [`DeferredWrite`] handles so a field (a length
//! prefix, a count) can be patched once its final value is known. Readers
//! keep their position in an external [`ReadContext`], so one buffer can be
//! walked by several readers independently.
//!
//! Plain writes use little-endian order on every host; the
//! `*_network_byte_order` variants use big-endian.

use std::marker::PhantomData;

use crate::error::{NetworkError, Result};

/// Smallest capacity a growable writer allocates on first use
const MIN_GROWABLE_CAPACITY: usize = 64;

mod sealed {
    pub trait Sealed {}
}

/// Fixed-width value that can be stored in a data stream
pub trait Primitive: Copy + sealed::Sealed {
    const SIZE: usize;
    fn put_le(self, out: &mut [u8]);
    fn get_le(src: &[u8]) -> Self;
}

/// Integer types with a big-endian (network order) encoding
pub trait NetworkOrder: Primitive {
    fn put_be(self, out: &mut [u8]);
    fn get_be(src: &[u8]) -> Self;
}

macro_rules! impl_integer {
    ($($ty:ty),*) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Primitive for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn put_le(self, out: &mut [u8]) {
                    out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                }

                fn get_le(src: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&src[..Self::SIZE]);
                    <$ty>::from_le_bytes(raw)
                }
            }

            impl NetworkOrder for $ty {
                fn put_be(self, out: &mut [u8]) {
                    out[..Self::SIZE].copy_from_slice(&self.to_be_bytes());
                }

                fn get_be(src: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&src[..Self::SIZE]);
                    <$ty>::from_be_bytes(raw)
                }
            }
        )*
    };
}

impl_integer!(u8, i8, u16, i16, u32, i32, u64, i64);

// Floats travel as their raw bit pattern.
macro_rules! impl_float {
    ($($ty:ty => $bits:ty),*) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Primitive for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn put_le(self, out: &mut [u8]) {
                    self.to_bits().put_le(out);
                }

                fn get_le(src: &[u8]) -> Self {
                    <$ty>::from_bits(<$bits>::get_le(src))
                }
            }
        )*
    };
}

impl_float!(f32 => u32, f64 => u64);

/// Handle to a field written earlier, used to overwrite it in place
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredWrite<T> {
    offset: usize,
    epoch: u32,
    _marker: PhantomData<T>,
}

impl<T: Primitive> DeferredWrite<T> {
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Overwrite the field with `value`. The writer's length is unchanged.
    pub fn update(&self, writer: &mut DataStreamWriter, value: T) -> Result<()> {
        let slot = writer.deferred_slot(self.offset, self.epoch, T::SIZE)?;
        value.put_le(slot);
        Ok(())
    }
}

impl<T: NetworkOrder> DeferredWrite<T> {
    pub fn update_network_byte_order(&self, writer: &mut DataStreamWriter, value: T) -> Result<()> {
        let slot = writer.deferred_slot(self.offset, self.epoch, T::SIZE)?;
        value.put_be(slot);
        Ok(())
    }
}

/// Append-only byte buffer with an explicit capacity
///
/// A fixed writer fails writes that do not fit; a growable writer (created
/// with capacity 0 or via [`DataStreamWriter::growable`]) doubles instead.
#[derive(Debug, Clone)]
pub struct DataStreamWriter {
    buffer: Vec<u8>,
    length: usize,
    growable: bool,
    epoch: u32,
}

impl Default for DataStreamWriter {
    fn default() -> Self {
        Self::growable(0)
    }
}

impl DataStreamWriter {
    /// Fixed-capacity writer; `capacity == 0` yields a growable one
    pub fn new(capacity: usize) -> Self {
        if capacity == 0 {
            return Self::growable(0);
        }
        DataStreamWriter {
            buffer: vec![0u8; capacity],
            length: 0,
            growable: false,
            epoch: 0,
        }
    }

    /// Writer that grows by doubling whenever a write does not fit
    pub fn growable(initial_capacity: usize) -> Self {
        DataStreamWriter {
            buffer: vec![0u8; initial_capacity],
            length: 0,
            growable: true,
            epoch: 0,
        }
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn is_growable(&self) -> bool {
        self.growable
    }

    /// The written bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[..self.length]
    }

    /// Reader over the written bytes
    pub fn reader(&self) -> DataStreamReader<'_> {
        DataStreamReader::new(self.as_slice())
    }

    /// Append `value` in little-endian order
    pub fn write<T: Primitive>(&mut self, value: T) -> Result<DeferredWrite<T>> {
        let offset = self.length;
        let slot = self.append(T::SIZE)?;
        value.put_le(slot);
        Ok(self.deferred(offset))
    }

    /// Append `value` in big-endian order
    pub fn write_network_byte_order<T: NetworkOrder>(&mut self, value: T) -> Result<DeferredWrite<T>> {
        let offset = self.length;
        let slot = self.append(T::SIZE)?;
        value.put_be(slot);
        Ok(self.deferred(offset))
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        let slot = self.append(data.len())?;
        slot.copy_from_slice(data);
        Ok(())
    }

    /// Change the capacity; cannot drop below the written length
    pub fn resize_capacity(&mut self, new_capacity: usize) -> Result<()> {
        if new_capacity < self.length {
            return Err(NetworkError::CapacityBelowLength {
                requested: new_capacity,
                length: self.length,
            });
        }
        self.buffer.resize(new_capacity, 0);
        Ok(())
    }

    /// Drop all written bytes. Outstanding deferred writes become stale.
    pub fn clear(&mut self) {
        self.length = 0;
        self.epoch = self.epoch.wrapping_add(1);
    }

    /// Copy `dest.len()` bytes starting at `start` into `dest`
    pub fn copy_to(&self, start: usize, dest: &mut [u8]) -> Result<()> {
        let end = start
            .checked_add(dest.len())
            .filter(|end| *end <= self.length)
            .ok_or(NetworkError::OutOfRange {
                offset: start,
                requested: dest.len(),
                length: self.length,
            })?;
        dest.copy_from_slice(&self.buffer[start..end]);
        Ok(())
    }

    /// Free space after the written bytes, at least `max` long.
    ///
    /// Used by the receive path: a growable writer doubles until `max` bytes
    /// fit, a fixed writer returns `None` once it is full. Bytes written into
    /// the slice become part of the stream only after [`commit`](Self::commit).
    pub fn reserve_tail(&mut self, max: usize) -> Option<&mut [u8]> {
        if self.capacity() - self.length < max {
            if !self.growable {
                return None;
            }
            self.grow_to(self.length + max);
        }
        let start = self.length;
        Some(&mut self.buffer[start..start + max])
    }

    /// Extend the written length over bytes placed by [`reserve_tail`](Self::reserve_tail)
    pub fn commit(&mut self, len: usize) -> Result<()> {
        let available = self.capacity() - self.length;
        if len > available {
            return Err(NetworkError::BufferOverflow {
                needed: len,
                available,
            });
        }
        self.length += len;
        Ok(())
    }

    fn append(&mut self, size: usize) -> Result<&mut [u8]> {
        let available = self.capacity() - self.length;
        if size > available {
            if !self.growable {
                return Err(NetworkError::BufferOverflow {
                    needed: size,
                    available,
                });
            }
            self.grow_to(self.length + size);
        }
        let start = self.length;
        self.length += size;
        Ok(&mut self.buffer[start..start + size])
    }

    fn grow_to(&mut self, needed: usize) {
        let mut capacity = self.capacity().max(MIN_GROWABLE_CAPACITY);
        while capacity < needed {
            capacity *= 2;
        }
        self.buffer.resize(capacity, 0);
    }

    fn deferred<T>(&self, offset: usize) -> DeferredWrite<T> {
        DeferredWrite {
            offset,
            epoch: self.epoch,
            _marker: PhantomData,
        }
    }

    fn deferred_slot(&mut self, offset: usize, epoch: u32, size: usize) -> Result<&mut [u8]> {
        if epoch != self.epoch || offset + size > self.length {
            return Err(NetworkError::StaleDeferredWrite);
        }
        Ok(&mut self.buffer[offset..offset + size])
    }
}

/// Read position for a [`DataStreamReader`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReadContext {
    pub read_index: usize,
}

/// Bounds-checked reader over a byte slice
#[derive(Debug, Clone, Copy)]
pub struct DataStreamReader<'a> {
    data: &'a [u8],
}

impl<'a> DataStreamReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        DataStreamReader { data }
    }

    pub fn length(&self) -> usize {
        self.data.len()
    }

    pub fn remaining(&self, ctx: &ReadContext) -> usize {
        self.data.len().saturating_sub(ctx.read_index)
    }

    pub fn read<T: Primitive>(&self, ctx: &mut ReadContext) -> Result<T> {
        self.read_slice(ctx, T::SIZE).map(T::get_le)
    }

    pub fn read_network_byte_order<T: NetworkOrder>(&self, ctx: &mut ReadContext) -> Result<T> {
        self.read_slice(ctx, T::SIZE).map(T::get_be)
    }

    /// Fill `dest` from the stream
    pub fn read_bytes(&self, ctx: &mut ReadContext, dest: &mut [u8]) -> Result<()> {
        let src = self.read_slice(ctx, dest.len())?;
        dest.copy_from_slice(src);
        Ok(())
    }

    /// Borrow the next `len` bytes. The cursor does not move on failure.
    pub fn read_slice(&self, ctx: &mut ReadContext, len: usize) -> Result<&'a [u8]> {
        let start = ctx.read_index;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(NetworkError::OutOfRange {
                offset: start,
                requested: len,
                length: self.data.len(),
            })?;
        ctx.read_index = end;
        Ok(&self.data[start..end])
    }
}
