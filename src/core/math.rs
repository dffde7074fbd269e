//! Activation functions shared across the trainer.

/// Sigmoid activation function: σ(x) = 1 / (1 + e^(-x))
///
/// Maps R → (0, 1). Used for opacity and mask logits (converts unbounded
/// optimization to a valid probability).
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Inverse sigmoid (logit): logit(p) = log(p / (1-p))
///
/// Maps (0, 1) → R. Used to move probabilities back into optimization space,
/// e.g. for the opacity reset.
pub fn inverse_sigmoid(p: f32) -> f32 {
    // Clamp to avoid log(0) or division by zero
    let p_clamped = p.clamp(1e-6, 1.0 - 1e-6);
    (p_clamped / (1.0 - p_clamped)).ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_sigmoid() {
        assert_relative_eq!(sigmoid(0.0), 0.5, epsilon = 1e-6);
        assert!(sigmoid(10.0) > 0.99);
        assert!(sigmoid(-10.0) < 0.01);
    }

    #[test]
    fn test_sigmoid_inverse_roundtrip() {
        let p = 0.7;
        let x = inverse_sigmoid(p);
        assert_relative_eq!(sigmoid(x), p, epsilon = 1e-6);
    }

    #[test]
    fn test_inverse_sigmoid_clamps_extremes() {
        assert!(inverse_sigmoid(0.0).is_finite());
        assert!(inverse_sigmoid(1.0).is_finite());
    }
}
