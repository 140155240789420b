use ndarray::{stack, Array, ArrayView, Axis, Dimension, IntoDimension, RemoveAxis, ShapeBuilder, ShapeError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

pub fn generate_noise<Sh, D>(shape: Sh, rng: &mut (impl Rng + ?Sized)) -> Array<f32, D>
where
    Sh: ShapeBuilder<Dim = D>,
    D: Dimension,
{
    Array::from_shape_simple_fn(shape, || rng.sample(StandardNormal))
}

// one rng per item, so an item's noise does not depend on the rest of the batch
pub fn seeded_noise<Sh, D>(item_shape: Sh, seeds: &[u64]) -> Result<Array<f32, D::Larger>, ShapeError>
where
    Sh: IntoDimension<Dim = D>,
    D: Dimension,
    D::Larger: RemoveAxis,
{
    let item_shape = item_shape.into_dimension();
    let items: Vec<Array<f32, D>> = seeds
        .iter()
        .map(|&seed| generate_noise(item_shape.clone(), &mut StdRng::seed_from_u64(seed)))
        .collect();
    let views: Vec<ArrayView<'_, f32, D>> = items.iter().map(|item| item.view()).collect();
    stack(Axis(0), &views)
}

#[cfg(test)]
mod tests {
    use ndarray::{s, Array4};
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn noise_is_roughly_standard_normal() {
        let noise: Array4<f32> = generate_noise((4, 4, 32, 32), &mut StdRng::seed_from_u64(42));
        let n = noise.len() as f32;
        let mean = noise.sum() / n;
        let var = noise.mapv(|x| (x - mean).powi(2)).sum() / n;
        assert!(mean.abs() < 0.05, "mean = {mean}");
        assert!((var - 1.).abs() < 0.05, "var = {var}");
    }

    #[test]
    fn seeded_items_ignore_batch_composition() {
        let pair = seeded_noise((4, 8, 8), &[1, 2]).unwrap();
        let single = seeded_noise((4, 8, 8), &[2]).unwrap();
        assert_eq!(pair.shape(), &[2, 4, 8, 8]);
        assert_eq!(pair.slice(s![1, .., .., ..]), single.slice(s![0, .., .., ..]));
        assert!(pair.slice(s![0, .., .., ..]) != pair.slice(s![1, .., .., ..]));
    }

    #[test]
    fn seeded_noise_needs_a_seed() {
        assert!(seeded_noise((4, 8, 8), &[]).is_err());
    }
}
