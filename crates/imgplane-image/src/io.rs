//! Image data path
//!
//! Reads fall back to the parent for objects a clone has not written yet,
//! limited to the parent overlap. The first write to such an object copies
//! the parent's data for the whole object up before the write lands.

use crate::handle::{ImageCtx, ImageMetadata};
use crate::layout::object_name;
use crate::lock;
use futures::FutureExt;
use futures::future::BoxFuture;
use imgplane_common::{Error, Features, Result, SnapContext, SnapId};
use tracing::debug;

fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::invalid_argument(format!("length {value} too large")))
}

/// Validate a range against the image size at the bound revision and
/// return its length clipped to the end of the image
pub fn clip_io(ictx: &ImageCtx, offset: u64, len: u64) -> Result<u64> {
    let size = ictx.metadata().size_at(ictx.snap_id())?;
    if offset > size {
        return Err(Error::invalid_argument(format!(
            "offset {offset} beyond image size {size}"
        )));
    }
    Ok(len.min(size - offset))
}

/// `(object offset, image offset, length)` pieces of `objno` that are
/// still backed by the parent
fn parent_ranges(md: &ImageMetadata, objno: u64, overlap: u64) -> Vec<(u64, u64, u64)> {
    let mut out = Vec::new();
    let mut obj_off = 0;
    for (image_off, len) in md.layout.object_image_extents(objno) {
        if image_off < overlap {
            out.push((obj_off, image_off, len.min(overlap - image_off)));
        }
        obj_off += len;
    }
    out
}

/// Read a range at the handle's revision. The flag reports whether any
/// byte came from a stored object rather than a hole.
fn read_at(ictx: &ImageCtx, offset: u64, len: u64) -> BoxFuture<'_, Result<(Vec<u8>, bool)>> {
    async move {
        let md = ictx.metadata();
        let snap = ictx.snap_id();
        let store = ictx.context().store();
        let overlap = md.overlap_at(snap)?;

        let mut buf = vec![0u8; to_usize(len)?];
        let mut found = false;
        for ext in md.layout.map_extent(offset, len) {
            let start = to_usize(ext.buffer_offset)?;
            if ictx.object_may_exist(ext.objno) {
                let oid = object_name(&md.object_prefix, ext.objno);
                match store
                    .object_read(ictx.pool(), &oid, snap, ext.offset, ext.length)
                    .await
                {
                    Ok(data) => {
                        buf[start..start + data.len()].copy_from_slice(&data);
                        found = true;
                        continue;
                    }
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }

            let image_off = offset + ext.buffer_offset;
            if image_off < overlap {
                let parent = ictx
                    .parent()
                    .ok_or_else(|| Error::internal(format!("parent of {} not open", ictx.name())))?;
                let parent_len = ext.length.min(overlap - image_off);
                let (data, hit) = read_at(&parent, image_off, parent_len).await?;
                buf[start..start + data.len()].copy_from_slice(&data);
                found |= hit;
            }
        }
        Ok((buf, found))
    }
    .boxed()
}

/// Seed object `objno` of a clone with its parent's data. Returns whether
/// anything was written; a no-op when the object already exists.
pub(crate) async fn copyup(ictx: &ImageCtx, md: &ImageMetadata, objno: u64) -> Result<bool> {
    let overlap = md.overlap_at(SnapId::HEAD)?;
    let ranges = parent_ranges(md, objno, overlap);
    if ranges.is_empty() {
        return Ok(false);
    }

    let store = ictx.context().store();
    let oid = object_name(&md.object_prefix, objno);
    if ictx.object_may_exist(objno) {
        match store.object_stat(ictx.pool(), &oid, SnapId::HEAD).await {
            Ok(_) => return Ok(false),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }

    let parent = ictx
        .parent()
        .ok_or_else(|| Error::internal(format!("parent of {} not open", ictx.name())))?;
    // With deep-flatten the copied data is visible to existing snapshots too
    let snapc = if md.features.contains(Features::DEEP_FLATTEN) {
        SnapContext::empty()
    } else {
        md.snap_context()
    };

    let mut wrote = false;
    for (obj_off, image_off, len) in ranges {
        let (data, _) = read_at(&parent, image_off, len).await?;
        if data.iter().all(|b| *b == 0) {
            continue;
        }
        if !wrote {
            ictx.mark_object(objno).await?;
        }
        store
            .object_write(ictx.pool(), &oid, &snapc, obj_off, &data)
            .await?;
        wrote = true;
    }
    if wrote {
        debug!("Copied up object {objno} of {}", ictx.name());
    }
    Ok(wrote)
}

async fn write_object(
    ictx: &ImageCtx,
    md: &ImageMetadata,
    objno: u64,
    obj_off: u64,
    payload: &[u8],
) -> Result<()> {
    let store = ictx.context().store();
    let oid = object_name(&md.object_prefix, objno);
    let inherits = !parent_ranges(md, objno, md.overlap_at(SnapId::HEAD)?).is_empty();

    let _gate = if inherits {
        let gate = ictx.copyup_gate().lock().await;
        copyup(ictx, md, objno).await?;
        Some(gate)
    } else {
        None
    };
    ictx.mark_object(objno).await?;
    store
        .object_write(ictx.pool(), &oid, &md.snap_context(), obj_off, payload)
        .await
}

fn require_writable(ictx: &ImageCtx) -> Result<()> {
    if ictx.is_read_only() {
        return Err(Error::ReadOnly(format!("{} is opened read-only", ictx.name())));
    }
    Ok(())
}

/// Read up to `len` bytes, clipped to the image end
pub async fn read(ictx: &ImageCtx, offset: u64, len: u64) -> Result<Vec<u8>> {
    ictx.refresh_if_required().await?;
    let _owner = ictx.owner_lock().read().await;
    let len = clip_io(ictx, offset, len)?;
    let (data, _) = read_at(ictx, offset, len).await?;
    Ok(data)
}

/// Visit a range one stripe period at a time. Chunks without any stored
/// data are reported as `None`.
pub async fn read_iterate<F>(ictx: &ImageCtx, offset: u64, len: u64, mut visit: F) -> Result<u64>
where
    F: FnMut(u64, Option<&[u8]>) -> Result<()>,
{
    ictx.refresh_if_required().await?;
    let _owner = ictx.owner_lock().read().await;
    let len = clip_io(ictx, offset, len)?;
    let period = ictx.metadata().layout.period();

    let end = offset + len;
    let mut pos = offset;
    while pos < end {
        let chunk_end = ((pos / period + 1) * period).min(end);
        let (data, found) = read_at(ictx, pos, chunk_end - pos).await?;
        visit(pos, found.then_some(data.as_slice()))?;
        pos = chunk_end;
    }
    Ok(len)
}

/// Write `data` at `offset`; the range must lie inside the image
pub async fn write(ictx: &ImageCtx, offset: u64, data: &[u8]) -> Result<usize> {
    ictx.refresh_if_required().await?;
    require_writable(ictx)?;
    let _owner = ictx.owner_lock().read().await;
    lock::ensure_owner(ictx).await?;

    let len = clip_io(ictx, offset, data.len() as u64)?;
    let md = ictx.metadata();
    for ext in md.layout.map_extent(offset, len) {
        let start = to_usize(ext.buffer_offset)?;
        let end = start + to_usize(ext.length)?;
        write_object(ictx, &md, ext.objno, ext.offset, &data[start..end]).await?;
    }
    to_usize(len)
}

/// Deallocate a range; it reads back as zeros afterwards
pub async fn discard(ictx: &ImageCtx, offset: u64, len: u64) -> Result<u64> {
    ictx.refresh_if_required().await?;
    require_writable(ictx)?;
    let _owner = ictx.owner_lock().read().await;
    lock::ensure_owner(ictx).await?;

    let len = clip_io(ictx, offset, len)?;
    let md = ictx.metadata();
    let store = ictx.context().store();
    let snapc = md.snap_context();
    let overlap = md.overlap_at(SnapId::HEAD)?;
    let object_size = md.layout.object_size();

    for ext in md.layout.map_extent(offset, len) {
        if !parent_ranges(&md, ext.objno, overlap).is_empty() {
            // Removing the object would expose the parent again
            let zeros = vec![0u8; to_usize(ext.length)?];
            write_object(ictx, &md, ext.objno, ext.offset, &zeros).await?;
            continue;
        }
        if !ictx.object_may_exist(ext.objno) {
            continue;
        }

        let oid = object_name(&md.object_prefix, ext.objno);
        if ext.offset == 0 && ext.length == object_size {
            match store.object_remove(ictx.pool(), &oid, &snapc).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            continue;
        }

        let current = match store.object_stat(ictx.pool(), &oid, SnapId::HEAD).await {
            Ok(size) => size,
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        };
        if ext.offset >= current {
            continue;
        }
        if ext.offset + ext.length >= current {
            store
                .object_truncate(ictx.pool(), &oid, &snapc, ext.offset)
                .await?;
        } else {
            let zeros = vec![0u8; to_usize(ext.length)?];
            store
                .object_write(ictx.pool(), &oid, &snapc, ext.offset, &zeros)
                .await?;
        }
    }
    Ok(len)
}
