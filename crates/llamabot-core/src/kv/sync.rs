use super::{KvCacheState, PointerArray};
use crate::{
    backend::{decode_batched, DecodeItem, NativeBackend, ALL_SEQUENCES},
    token::SequencedToken,
    Error, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShiftOp {
    pub start: usize,
    pub count: usize,
    pub delta: isize,
}

/// Work issued by one synchronization.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Length of the common prefix left untouched.
    pub matched: usize,
    pub shift: Option<ShiftOp>,
    /// Cells removed from the native cache, as `[start, end)`.
    pub removed: Option<(usize, usize)>,
    /// Number of decoded positions.
    pub decoded: usize,
    /// The logits held by the backend do not belong to the last live position.
    pub stale: bool,
}

/// Makes the native cache hold exactly `buffer[..pointer]` with the least work:
/// keep the common prefix, slide the longest reusable block of the old cache
/// down onto the first mismatch, drop the rest, and decode what is missing.
pub fn sync<B>(
    cache: &mut KvCacheState,
    buffer: &PointerArray<SequencedToken>,
    backend: &mut B,
) -> Result<SyncReport>
where
    B: NativeBackend + ?Sized,
{
    let pointer = buffer.len();
    if let Some(index) = buffer.iter().position(SequencedToken::is_null) {
        return Err(Error::invariant(format!("null token at live index {index}")));
    }

    let cells = cache.cells().to_vec();
    let cache_len = cells.len();
    let live = buffer.as_slice();

    let matched = cells
        .iter()
        .zip(live)
        .take_while(|(cell, token)| cell == token)
        .count();

    let (mut best_start, mut best_count) = (matched, 0);
    for start in matched..cache_len {
        let count = cells[start..]
            .iter()
            .zip(&live[matched..])
            .take_while(|(cell, token)| cell == token)
            .count();
        if count > best_count {
            (best_start, best_count) = (start, count);
        }
    }

    let mut report = SyncReport {
        matched,
        ..Default::default()
    };

    cache.begin_pass();
    for index in 0..matched {
        cache.keep(index)?;
    }

    // cells still occupied natively once the shift is done
    let mut occupied = cache_len;
    if best_count > 0 && best_start > matched {
        let distance = best_start - matched;
        let delta = -(distance as isize);
        let end = best_start + best_count;
        backend.remove_cache_tokens(ALL_SEQUENCES, matched, best_start)?;
        backend.shift_cache_tokens(ALL_SEQUENCES, best_start, end, delta)?;
        for offset in 0..best_count {
            cache.relocate(best_start + offset, matched + offset)?;
        }
        if end == cache_len {
            occupied = matched + best_count;
        }
        report.shift = Some(ShiftOp {
            start: best_start,
            count: best_count,
            delta,
        });
        log::debug!("[sync][shift][start: {best_start}][count: {best_count}][delta: {delta}]");
    } else {
        best_count = 0;
    }

    // a fully cached buffer keeps its last cell; stale logits are reported
    // instead of re-decoding here
    let clear_start = matched + best_count;
    cache.commit()?;

    if clear_start < occupied {
        backend.remove_cache_tokens(ALL_SEQUENCES, clear_start, occupied)?;
        report.removed = Some((clear_start, occupied));
    }

    let mut items = vec![];
    for (index, token) in live.iter().enumerate() {
        if cache.get(index) != Some(token) {
            items.push(DecodeItem {
                token: token.id(),
                position: index,
                seq_ids: token.seq_ids.clone(),
                logits: false,
            });
        }
    }
    report.decoded = items.len();
    if !items.is_empty() {
        let last = items.iter().map(|x| x.position).max();
        decode_batched(backend, items)?;
        for index in clear_start..pointer {
            cache.write(index, live[index].clone())?;
        }
        cache.set_logits_position(last);
    }

    report.stale = pointer > 0 && cache.logits_position() != Some(pointer - 1);
    log::debug!("[sync] {report:?}");
    Ok(report)
}

/// [`sync`], then re-decodes the last live position if its logits are stale.
pub fn evaluate<B>(
    cache: &mut KvCacheState,
    buffer: &PointerArray<SequencedToken>,
    backend: &mut B,
) -> Result<SyncReport>
where
    B: NativeBackend + ?Sized,
{
    let mut report = sync(cache, buffer, backend)?;
    if !report.stale {
        return Ok(report);
    }

    let position = buffer.len() - 1;
    let token = buffer[position].clone();
    backend.remove_cache_tokens(ALL_SEQUENCES, position, position + 1)?;
    decode_batched(
        backend,
        vec![DecodeItem {
            token: token.id(),
            position,
            seq_ids: token.seq_ids.clone(),
            logits: true,
        }],
    )?;
    cache.write(position, token)?;
    cache.set_logits_position(Some(position));
    report.decoded += 1;
    log::debug!("[sync][refresh][position: {position}]");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::scripted::{BackendCall, ScriptedBackend},
        token::{Token, TokenMask},
    };

    fn buffer(ids: &[i32]) -> PointerArray<SequencedToken> {
        let mut buffer = PointerArray::new(16);
        for &id in ids {
            buffer
                .write(SequencedToken::single(Token::new(id, "", TokenMask::USER)))
                .unwrap();
        }
        buffer
    }

    #[test]
    fn mismatch_inside_reused_block_is_decoded() {
        let mut backend = ScriptedBackend::new(["a", "b", "c", "d", "e", "f"]).with_favorite(0, 1.0);
        let mut cache = KvCacheState::new(16);
        sync(&mut cache, &buffer(&[0, 1, 2, 3, 4]), &mut backend).unwrap();

        // drop `1`, replace the tail
        let target = buffer(&[0, 2, 3, 5]);
        backend.clear_calls();
        let report = sync(&mut cache, &target, &mut backend).unwrap();
        assert_eq!(report.matched, 1);
        assert_eq!(
            report.shift,
            Some(ShiftOp {
                start: 2,
                count: 2,
                delta: -1
            })
        );
        assert_eq!(report.decoded, 1);
        assert_eq!(backend.cells(), vec![Some(0), Some(2), Some(3), Some(5)]);
        assert!(!report.stale);
    }

    #[test]
    fn shorter_buffer_only_truncates() {
        let mut backend = ScriptedBackend::new(["a", "b", "c", "d"]).with_favorite(0, 1.0);
        let mut cache = KvCacheState::new(16);
        sync(&mut cache, &buffer(&[0, 1, 2, 3]), &mut backend).unwrap();
        backend.clear_calls();

        let target = buffer(&[0, 1]);
        let report = sync(&mut cache, &target, &mut backend).unwrap();
        assert_eq!(report.decoded, 0);
        assert_eq!(report.removed, Some((2, 4)));
        assert!(report.stale);

        let report = evaluate(&mut cache, &target, &mut backend).unwrap();
        assert_eq!(report.decoded, 1);
        assert_eq!(cache.logits_position(), Some(1));
        assert_eq!(backend.cells(), vec![Some(0), Some(1)]);
        assert!(matches!(backend.calls().last(), Some(BackendCall::Decode(_))));
    }

    #[test]
    fn null_token_in_live_range_is_rejected() {
        let mut backend = ScriptedBackend::new(["a"]);
        let mut cache = KvCacheState::new(4);
        let mut target = buffer(&[0]);
        target.write(SequencedToken::default()).unwrap();
        assert!(matches!(
            sync(&mut cache, &target, &mut backend),
            Err(Error::Invariant(_))
        ));
    }
}
