//! Striping layout for image data
//!
//! Maps image byte ranges to data objects. An image is cut into stripe
//! units which are laid round-robin across `stripe_count` objects; once
//! those objects are full the next object set begins.
//!
//! ```text
//! stripe_count = 3, 4 units per object
//!
//!          obj 0   obj 1   obj 2
//! stripe0  su 0    su 1    su 2
//! stripe1  su 3    su 4    su 5
//! stripe2  su 6    su 7    su 8
//! stripe3  su 9    su 10   su 11     ← object set 0 full
//!          obj 3   obj 4   obj 5
//! stripe4  su 12   ...
//! ```

use imgplane_common::{Error, Result};

/// Smallest and largest supported object order
pub const MIN_ORDER: u8 = 12;
pub const MAX_ORDER: u8 = 25;

/// A piece of an image range stored in one object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectExtent {
    pub objno: u64,
    /// Byte offset within the object
    pub offset: u64,
    pub length: u64,
    /// Offset of this piece within the caller's buffer
    pub buffer_offset: u64,
}

/// Object size and striping parameters of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    order: u8,
    stripe_unit: u64,
    stripe_count: u64,
}

impl Layout {
    /// Validate and build a layout. `stripe_unit == 0` means one object.
    pub fn new(order: u8, stripe_unit: u64, stripe_count: u64) -> Result<Self> {
        if !(MIN_ORDER..=MAX_ORDER).contains(&order) {
            return Err(Error::invalid_argument(format!(
                "order {order} outside {MIN_ORDER}..={MAX_ORDER}"
            )));
        }
        let object_size = 1u64 << order;
        let stripe_unit = if stripe_unit == 0 {
            object_size
        } else {
            stripe_unit
        };
        if stripe_unit > object_size || object_size % stripe_unit != 0 {
            return Err(Error::invalid_argument(format!(
                "stripe unit {stripe_unit} must divide object size {object_size}"
            )));
        }
        if stripe_count == 0 {
            return Err(Error::invalid_argument("stripe count must be at least 1"));
        }
        Ok(Self {
            order,
            stripe_unit,
            stripe_count,
        })
    }

    #[must_use]
    pub const fn order(&self) -> u8 {
        self.order
    }

    #[must_use]
    pub const fn object_size(&self) -> u64 {
        1 << self.order
    }

    #[must_use]
    pub const fn stripe_unit(&self) -> u64 {
        self.stripe_unit
    }

    #[must_use]
    pub const fn stripe_count(&self) -> u64 {
        self.stripe_count
    }

    /// Bytes covered by one full object set
    #[must_use]
    pub const fn period(&self) -> u64 {
        self.object_size() * self.stripe_count
    }

    /// Whether non-default striping needs the striping feature
    #[must_use]
    pub const fn is_fancy(&self) -> bool {
        self.stripe_unit != self.object_size() || self.stripe_count != 1
    }

    /// Number of objects backing an image of `size` bytes
    #[must_use]
    pub const fn num_objects(&self, size: u64) -> u64 {
        let period = self.period();
        let num_periods = size.div_ceil(period);
        let remainder = size % period;
        let unused = if remainder > 0 && remainder < self.stripe_count * self.stripe_unit {
            self.stripe_count - remainder.div_ceil(self.stripe_unit)
        } else {
            0
        };
        num_periods * self.stripe_count - unused
    }

    /// Split an image range into object extents
    #[must_use]
    pub fn map_extent(&self, offset: u64, len: u64) -> Vec<ObjectExtent> {
        let su = self.stripe_unit;
        let sc = self.stripe_count;
        let units_per_object = self.object_size() / su;

        let mut out: Vec<ObjectExtent> = Vec::new();
        let mut cur = offset;
        let end = offset + len;
        while cur < end {
            let blockno = cur / su;
            let stripeno = blockno / sc;
            let stripepos = blockno % sc;
            let objectsetno = stripeno / units_per_object;
            let objno = objectsetno * sc + stripepos;
            let block_off = cur % su;
            let obj_off = (stripeno % units_per_object) * su + block_off;
            let piece = (su - block_off).min(end - cur);
            let buffer_offset = cur - offset;

            match out.last_mut() {
                Some(last)
                    if last.objno == objno
                        && last.offset + last.length == obj_off
                        && last.buffer_offset + last.length == buffer_offset =>
                {
                    last.length += piece;
                }
                _ => out.push(ObjectExtent {
                    objno,
                    offset: obj_off,
                    length: piece,
                    buffer_offset,
                }),
            }
            cur += piece;
        }
        out
    }

    /// Image ranges `(offset, len)` stored by the whole of object `objno`
    #[must_use]
    pub fn object_image_extents(&self, objno: u64) -> Vec<(u64, u64)> {
        let su = self.stripe_unit;
        let sc = self.stripe_count;
        let units_per_object = self.object_size() / su;
        let objectsetno = objno / sc;
        let stripepos = objno % sc;

        let mut out: Vec<(u64, u64)> = Vec::new();
        for unit in 0..units_per_object {
            let stripeno = objectsetno * units_per_object + unit;
            let image_off = (stripeno * sc + stripepos) * su;
            match out.last_mut() {
                Some((off, len)) if *off + *len == image_off => *len += su,
                _ => out.push((image_off, su)),
            }
        }
        out
    }
}

/// Name of data object `objno` under `prefix`
#[must_use]
pub fn object_name(prefix: &str, objno: u64) -> String {
    format!("{prefix}.{objno:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_default_layout_one_object_per_period() {
        let layout = Layout::new(22, 0, 1).unwrap();
        assert_eq!(layout.object_size(), 4 * MIB);
        assert_eq!(layout.period(), 4 * MIB);
        assert!(!layout.is_fancy());
        assert_eq!(layout.num_objects(10 * 1024 * MIB), 2560);
        assert_eq!(layout.num_objects(4 * MIB + 1), 2);
        assert_eq!(layout.num_objects(0), 0);
    }

    #[test]
    fn test_range_spanning_objects() {
        let layout = Layout::new(22, 0, 1).unwrap();
        let extents = layout.map_extent(4 * MIB - 100, 200);
        assert_eq!(
            extents,
            vec![
                ObjectExtent {
                    objno: 0,
                    offset: 4 * MIB - 100,
                    length: 100,
                    buffer_offset: 0
                },
                ObjectExtent {
                    objno: 1,
                    offset: 0,
                    length: 100,
                    buffer_offset: 100
                },
            ]
        );
    }

    #[test]
    fn test_striped_mapping() {
        // 64 KiB units over 3 objects of 4 MiB
        let layout = Layout::new(22, 64 * 1024, 3).unwrap();
        assert!(layout.is_fancy());
        let extents = layout.map_extent(0, 4 * 64 * 1024);
        let objnos: Vec<u64> = extents.iter().map(|e| e.objno).collect();
        assert_eq!(objnos, vec![0, 1, 2, 0]);
        assert_eq!(extents[3].offset, 64 * 1024);

        // Inverse mapping covers the object exactly
        let ranges = layout.object_image_extents(1);
        let total: u64 = ranges.iter().map(|(_, l)| l).sum();
        assert_eq!(total, layout.object_size());
        assert_eq!(ranges[0], (64 * 1024, 64 * 1024));
        for (off, len) in ranges {
            for e in layout.map_extent(off, len) {
                assert_eq!(e.objno, 1);
            }
        }
    }

    #[test]
    fn test_invalid_layouts() {
        assert!(Layout::new(11, 0, 1).is_err());
        assert!(Layout::new(22, 3000, 1).is_err());
        assert!(Layout::new(22, 0, 0).is_err());
        assert!(Layout::new(12, 8192, 1).is_err());
    }

    #[test]
    fn test_object_name() {
        assert_eq!(object_name("rbd_data.10ab", 26), "rbd_data.10ab.000000000000001a");
    }
}
