use ndarray::{s, Array3, ArrayView3, ArrayViewMut2, ArrayViewMut3, Axis};
use thiserror::Error;
use tracing::trace;

// q, k, v are (batch, tokens, channels); callers fold 1 / sqrt(channels) into q
pub fn attention(
    q: ArrayView3<'_, f32>,
    k: ArrayView3<'_, f32>,
    v: ArrayView3<'_, f32>,
    chunk_size: Option<usize>,
) -> Result<Array3<f32>, AttentionError> {
    check_qk(&q, &k)?;
    let (batch, queries, channels) = q.dim();
    let (v_batch, values, v_channels) = v.dim();
    if v_batch != batch {
        return Err(AttentionError::BatchMismatch {
            query: batch,
            other: v_batch,
        });
    }
    if v_channels != channels {
        return Err(AttentionError::ChannelMismatch {
            query: channels,
            other: v_channels,
        });
    }
    let keys = k.len_of(Axis(1));
    if keys != values {
        return Err(AttentionError::SequenceMismatch { keys, values });
    }

    let mut out = Array3::zeros((batch, queries, channels));
    let Some(chunk) = chunk_size else {
        attend(q, k, v, out.view_mut());
        return Ok(out);
    };
    if chunk == 0 {
        return Err(AttentionError::ZeroChunk);
    }

    for start in (0..batch).step_by(chunk) {
        let end = (start + chunk).min(batch);
        trace!(start, end, batch, "attention chunk");
        attend(
            q.slice(s![start..end, .., ..]),
            k.slice(s![start..end, .., ..]),
            v.slice(s![start..end, .., ..]),
            out.slice_mut(s![start..end, .., ..]),
        );
    }
    Ok(out)
}

pub fn attention_weights(
    q: ArrayView3<'_, f32>,
    k: ArrayView3<'_, f32>,
) -> Result<Array3<f32>, AttentionError> {
    check_qk(&q, &k)?;
    Ok(weights(q, k))
}

pub fn softmax(mut scores: ArrayViewMut2<'_, f32>) {
    for mut row in scores.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
        row.mapv_inplace(|x| (x - max).exp());
        let sum = row.sum();
        row /= sum;
    }
}

fn weights(q: ArrayView3<'_, f32>, k: ArrayView3<'_, f32>) -> Array3<f32> {
    let mut scores = Array3::zeros((q.len_of(Axis(0)), q.len_of(Axis(1)), k.len_of(Axis(1))));
    for ((mut scores, q), k) in scores
        .outer_iter_mut()
        .zip(q.outer_iter())
        .zip(k.outer_iter())
    {
        scores.assign(&q.dot(&k.t()));
        softmax(scores);
    }
    scores
}

fn attend(
    q: ArrayView3<'_, f32>,
    k: ArrayView3<'_, f32>,
    v: ArrayView3<'_, f32>,
    mut out: ArrayViewMut3<'_, f32>,
) {
    let weights = weights(q, k);
    for ((mut out, weights), v) in out
        .outer_iter_mut()
        .zip(weights.outer_iter())
        .zip(v.outer_iter())
    {
        out.assign(&weights.dot(&v));
    }
}

fn check_qk(q: &ArrayView3<'_, f32>, k: &ArrayView3<'_, f32>) -> Result<(), AttentionError> {
    let (batch, _, channels) = q.dim();
    let (k_batch, _, k_channels) = k.dim();
    if k_batch != batch {
        return Err(AttentionError::BatchMismatch {
            query: batch,
            other: k_batch,
        });
    }
    if k_channels != channels {
        return Err(AttentionError::ChannelMismatch {
            query: channels,
            other: k_channels,
        });
    }
    Ok(())
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AttentionError {
    #[error("batch size mismatch: query has {query}, key/value has {other}")]
    BatchMismatch { query: usize, other: usize },
    #[error("channel mismatch: query has {query}, key/value has {other}")]
    ChannelMismatch { query: usize, other: usize },
    #[error("key length {keys} does not match value length {values}")]
    SequenceMismatch { keys: usize, values: usize },
    #[error("chunk size must be positive")]
    ZeroChunk,
}

#[cfg(test)]
mod tests {
    use ndarray::{array, Array2};
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::noise::generate_noise;

    fn random(shape: (usize, usize, usize), seed: u64) -> Array3<f32> {
        generate_noise(shape, &mut StdRng::seed_from_u64(seed))
    }

    #[test]
    fn output_shape_follows_query() {
        let (q, k, v) = (random((2, 4, 8), 0), random((2, 4, 8), 1), random((2, 4, 8), 2));
        let out = attention(q.view(), k.view(), v.view(), None).unwrap();
        assert_eq!(out.dim(), (2, 4, 8));

        let (q, k, v) = (random((3, 5, 6), 0), random((3, 9, 6), 1), random((3, 9, 6), 2));
        let out = attention(q.view(), k.view(), v.view(), Some(2)).unwrap();
        assert_eq!(out.dim(), (3, 5, 6));
    }

    #[test]
    fn weights_are_distributions() {
        let q = random((3, 7, 16), 3) * 4.;
        let k = random((3, 11, 16), 4);
        let weights = attention_weights(q.view(), k.view()).unwrap();
        assert_eq!(weights.dim(), (3, 7, 11));
        for row in weights.rows() {
            assert!(row.iter().all(|&w| w >= 0.));
            assert!((row.sum() - 1.).abs() < 1e-5);
        }
    }

    #[test]
    fn softmax_survives_large_scores() {
        let mut scores: Array2<f32> = array![[1000., 1000.], [0., f32::MIN]];
        softmax(scores.view_mut());
        assert_eq!(scores, array![[0.5, 0.5], [1., 0.]]);
    }

    #[test]
    fn uniform_weights_average_values() {
        let q = Array3::<f32>::zeros((1, 2, 2));
        let k = random((1, 3, 2), 5);
        let v: Array3<f32> = array![[[1., 2.], [3., 4.], [5., 6.]]];
        let out = attention(q.view(), k.view(), v.view(), None).unwrap();
        for row in out.rows() {
            assert!((row[0] - 3.).abs() < 1e-5);
            assert!((row[1] - 4.).abs() < 1e-5);
        }
    }

    #[test]
    fn chunking_matches_unchunked() {
        let (q, k, v) = (random((5, 6, 8), 6), random((5, 10, 8), 7), random((5, 10, 8), 8));
        let full = attention(q.view(), k.view(), v.view(), None).unwrap();
        for chunk in [1, 2, 3, 5, 8] {
            let chunked = attention(q.view(), k.view(), v.view(), Some(chunk)).unwrap();
            let diff = (&chunked - &full).fold(0f32, |acc, &x| acc.max(x.abs()));
            assert!(diff < 1e-6, "chunk {chunk}: max diff {diff}");
        }
    }

    #[test]
    fn empty_batch_is_fine() {
        let empty = Array3::<f32>::zeros((0, 4, 8));
        let out = attention(empty.view(), empty.view(), empty.view(), Some(3)).unwrap();
        assert_eq!(out.dim(), (0, 4, 8));
    }

    #[test]
    fn rejects_mismatched_shapes() {
        let q = random((2, 4, 8), 0);
        let bad_batch = random((3, 4, 8), 1);
        let bad_channels = random((2, 4, 6), 1);
        let short = random((2, 3, 8), 1);

        assert!(matches!(
            attention(q.view(), bad_batch.view(), q.view(), None),
            Err(AttentionError::BatchMismatch { query: 2, other: 3 })
        ));
        assert!(matches!(
            attention(q.view(), q.view(), bad_batch.view(), None),
            Err(AttentionError::BatchMismatch { query: 2, other: 3 })
        ));
        assert!(matches!(
            attention(q.view(), bad_channels.view(), bad_channels.view(), None),
            Err(AttentionError::ChannelMismatch { query: 8, other: 6 })
        ));
        assert!(matches!(
            attention(q.view(), q.view(), short.view(), None),
            Err(AttentionError::SequenceMismatch { keys: 4, values: 3 })
        ));
        assert!(matches!(
            attention(q.view(), q.view(), q.view(), Some(0)),
            Err(AttentionError::ZeroChunk)
        ));
    }
}
