//! End-to-end generation tests on small CPU models.
//!
//! Two kinds of models are used. Randomly initialized ones check shapes,
//! streaming consistency, and bounds. "Rigged" ones have every weight zeroed
//! and selected head biases set by hand: the backbone latent is then zero
//! everywhere, each head produces exactly its bias, and greedy decoding
//! follows a script the test can predict.

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use multistream_lm::{
    GenerateParams, LmConfig, LmModel, Modality, SamplingPolicy, Token, TokenGrid,
    TransformerConfig,
};

fn small_backbone(max_seq_len: usize) -> TransformerConfig {
    TransformerConfig {
        dim: 32,
        num_heads: 2,
        intermediate_size: 64,
        num_layers: 2,
        max_seq_len,
        ..Default::default()
    }
}

fn audio_config(codebooks: usize, cardinality: usize, delays: Vec<usize>) -> LmConfig {
    LmConfig {
        num_audio_codebooks: codebooks,
        audio_cardinality: cardinality,
        text_cardinality: None,
        delays,
        backbone: small_backbone(64),
        ..Default::default()
    }
}

fn random_model(config: LmConfig) -> LmModel {
    let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F32, &Device::Cpu);
    LmModel::new(config, vb).unwrap()
}

/// Zero every weight, then overwrite selected 1-D variables (head biases).
fn rigged_model(config: LmConfig, overrides: &[(&str, Vec<f32>)]) -> LmModel {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = LmModel::new(config, vb).unwrap();
    let data = varmap.data().lock().unwrap();
    for var in data.values() {
        var.set(&Tensor::zeros(var.shape(), var.dtype(), var.device()).unwrap())
            .unwrap();
    }
    for (name, values) in overrides {
        let var = data
            .get(*name)
            .unwrap_or_else(|| panic!("no variable named {name}"));
        var.set(&Tensor::from_vec(values.clone(), values.len(), &Device::Cpu).unwrap())
            .unwrap();
    }
    drop(data);
    model
}

fn greedy(max_gen_len: usize) -> GenerateParams {
    GenerateParams {
        max_gen_len,
        policy: SamplingPolicy::Greedy,
        ..Default::default()
    }
}

fn stream(grid: &TokenGrid, b: usize, k: usize) -> Vec<Token> {
    (0..grid.steps()).map(|t| grid.get(b, k, t)).collect()
}

mod prompt_tests {
    use super::*;

    #[test]
    fn test_partial_prompt_completed_in_place() {
        let config = LmConfig {
            bias_proj: true,
            ..audio_config(1, 4, vec![0])
        };
        let model = rigged_model(config, &[("audio_heads.0.bias", vec![0.0, 10.0, 0.0, 0.0])]);

        let prompt = TokenGrid::from_rows(vec![vec![vec![
            Token::Value(0),
            Token::Ungenerated,
            Token::Value(2),
        ]]])
        .unwrap();
        let mut calls = Vec::new();
        let mut on_step = |done: usize, total: usize| calls.push((done, total));
        let out = model
            .generate(Some(&prompt), &[], None, &greedy(3), Some(&mut on_step))
            .unwrap();

        // the hole is sampled (the bias picks token 1), supplied values survive
        assert_eq!(
            stream(&out, 0, 0),
            vec![Token::Value(0), Token::Value(1), Token::Value(2)]
        );
        // replay starts one step before the hole
        assert_eq!(calls, vec![(1, 2), (2, 2)]);
    }

    #[test]
    fn test_delayed_stream_holds_start_until_its_turn() {
        // zero logits everywhere: greedy picks token 0 on every stream
        let model = rigged_model(audio_config(2, 6, vec![0, 1]), &[]);

        let mut calls = Vec::new();
        let mut on_step = |done: usize, total: usize| calls.push((done, total));
        let out = model
            .generate(None, &[], Some(1), &greedy(2), Some(&mut on_step))
            .unwrap();

        assert_eq!((out.batch(), out.codebooks(), out.steps()), (1, 2, 2));
        for k in 0..2 {
            assert_eq!(stream(&out, 0, k), vec![Token::Value(0); 2]);
        }
        // one extra physical step covers the lagging stream
        assert_eq!(calls, vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[test]
    fn test_min_start_offset_replays_decided_prompt() {
        let config = LmConfig {
            bias_proj: true,
            ..audio_config(1, 4, vec![0])
        };
        let model = rigged_model(config, &[("audio_heads.0.bias", vec![0.0, 10.0, 0.0, 0.0])]);
        let prompt = TokenGrid::from_rows(vec![vec![vec![
            Token::Value(2),
            Token::Value(3),
            Token::Value(2),
        ]]])
        .unwrap();
        let expected = vec![
            Token::Value(2),
            Token::Value(3),
            Token::Value(2),
            Token::Value(1),
        ];

        // a fully decided prompt fast-forwards to the last column
        let mut calls = Vec::new();
        let mut on_step = |done: usize, total: usize| calls.push((done, total));
        let out = model
            .generate(Some(&prompt), &[], None, &greedy(4), Some(&mut on_step))
            .unwrap();
        assert_eq!(calls, vec![(1, 1)]);
        assert_eq!(stream(&out, 0, 0), expected);

        // pinning the start offset forces a fixed-length replay instead
        let params = GenerateParams {
            min_start_offset: Some(1),
            ..greedy(4)
        };
        let mut calls = Vec::new();
        let mut on_step = |done: usize, total: usize| calls.push((done, total));
        let out = model
            .generate(Some(&prompt), &[], None, &params, Some(&mut on_step))
            .unwrap();
        assert_eq!(calls, vec![(1, 3), (2, 3), (3, 3)]);
        assert_eq!(stream(&out, 0, 0), expected);
    }

    #[test]
    fn test_prompt_values_survive_sampling() {
        let model = random_model(audio_config(2, 16, vec![0, 1]));
        let prompt = TokenGrid::from_rows(vec![vec![
            vec![Token::Value(5), Token::Value(9)],
            vec![Token::Value(1), Token::Value(7)],
        ]])
        .unwrap();
        let out = model
            .generate(Some(&prompt), &[], None, &greedy(4), None)
            .unwrap();

        assert_eq!((out.batch(), out.codebooks(), out.steps()), (1, 2, 4));
        for k in 0..2 {
            for t in 0..2 {
                assert_eq!(out.get(0, k, t), prompt.get(0, k, t));
            }
            for t in 2..4 {
                match out.get(0, k, t) {
                    Token::Value(v) => assert!((v as usize) < 16),
                    other => panic!("expected a sampled value, got {other:?}"),
                }
            }
        }
    }
}

mod guidance_tests {
    use super::*;
    use std::collections::HashMap;

    use anyhow::Result;
    use multistream_lm::conditions::{FuserConfig, PreparedConditions};
    use multistream_lm::{
        AttributeValue, ConditionAttributes, ConditionProvider, ConditionTensors,
    };

    /// Encodes every attribute, null or not, to an all-zero `[batch, 1, dim]`
    /// tensor: fusing it is the identity, so guided runs must reproduce the
    /// unconditional script exactly.
    struct ZeroProvider {
        dim: usize,
    }

    impl ConditionProvider for ZeroProvider {
        fn prepare(&self, attributes: &[ConditionAttributes]) -> Result<PreparedConditions> {
            let batch = attributes.len();
            let mut raw = HashMap::new();
            for attrs in attributes {
                for name in attrs.keys() {
                    if !raw.contains_key(name) {
                        raw.insert(
                            name.clone(),
                            Tensor::zeros((batch, 1), DType::F32, &Device::Cpu)?,
                        );
                    }
                }
            }
            Ok(PreparedConditions(raw))
        }

        fn encode(&self, prepared: PreparedConditions) -> Result<ConditionTensors> {
            prepared
                .0
                .into_iter()
                .map(|(name, marker)| {
                    let batch = marker.dim(0)?;
                    let zeros =
                        Tensor::zeros((batch, 1, self.dim), DType::F32, marker.device())?;
                    Ok((name, zeros))
                })
                .collect()
        }
    }

    fn script_rig() -> Vec<(&'static str, Vec<f32>)> {
        vec![
            ("audio_heads.0.bias", vec![0.0, 0.0, 10.0, 0.0, 0.0, 0.0]),
            ("audio_heads.1.bias", vec![0.0, 0.0, 0.0, 0.0, 10.0, 0.0]),
        ]
    }

    fn styled_model() -> LmModel {
        let config = LmConfig {
            bias_proj: true,
            fuser: FuserConfig {
                sum: vec!["style".to_string()],
                ..Default::default()
            },
            ..audio_config(2, 6, vec![0])
        };
        let model = rigged_model(config, &script_rig());
        model.with_condition_provider(Box::new(ZeroProvider { dim: 32 }))
    }

    fn style_attrs() -> Vec<ConditionAttributes> {
        vec![HashMap::from([(
            "style".to_string(),
            AttributeValue::Text("bright".to_string()),
        )])]
    }

    fn expect_script(out: &TokenGrid) {
        assert_eq!(stream(out, 0, 0), vec![Token::Value(2); 3]);
        assert_eq!(stream(out, 0, 1), vec![Token::Value(4); 3]);
    }

    #[test]
    fn test_unconditional_model_follows_script() {
        let config = LmConfig {
            bias_proj: true,
            ..audio_config(2, 6, vec![0])
        };
        let model = rigged_model(config, &script_rig());
        let out = model.generate(None, &[], None, &greedy(3), None).unwrap();
        expect_script(&out);
    }

    #[test]
    fn test_plain_conditioning_follows_script() {
        let out = styled_model()
            .generate(None, &style_attrs(), None, &greedy(3), None)
            .unwrap();
        expect_script(&out);
    }

    #[test]
    fn test_batch_doubled_guidance_follows_script() {
        let params = GenerateParams {
            cfg_coef: Some(3.0),
            ..greedy(3)
        };
        let out = styled_model()
            .generate(None, &style_attrs(), None, &params, None)
            .unwrap();
        expect_script(&out);
    }

    #[test]
    fn test_two_pass_guidance_follows_script() {
        let params = GenerateParams {
            cfg_coef: Some(3.0),
            two_step_cfg: Some(true),
            ..greedy(3)
        };
        let out = styled_model()
            .generate(None, &style_attrs(), None, &params, None)
            .unwrap();
        expect_script(&out);
    }
}

mod depth_tests {
    use super::*;
    use multistream_lm::DepthDecoderConfig;

    fn small_depth() -> DepthDecoderConfig {
        DepthDecoderConfig {
            dim: 16,
            num_heads: 2,
            intermediate_size: 32,
            num_layers: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_audio_only_burst_generation() {
        let config = LmConfig {
            depth_decoder: Some(small_depth()),
            ..audio_config(2, 16, vec![0, 1])
        };
        let model = random_model(config);
        let params = GenerateParams {
            check: true,
            ..greedy(4)
        };
        let out = model.generate(None, &[], Some(1), &params, None).unwrap();

        assert_eq!((out.batch(), out.codebooks(), out.steps()), (1, 2, 4));
        for k in 0..2 {
            for t in 0..4 {
                match out.get(0, k, t) {
                    Token::Value(v) => assert!((v as usize) < 16),
                    other => panic!("stream {k} step {t}: unexpected {other:?}"),
                }
            }
        }
    }

    #[test]
    fn test_text_and_audio_burst_generation() {
        let config = LmConfig {
            text_cardinality: Some(8),
            depth_decoder: Some(small_depth()),
            ..audio_config(2, 16, vec![0, 0, 1])
        };
        let model = random_model(config);
        let params = GenerateParams {
            modality: Modality::Both,
            ..greedy(3)
        };
        let out = model.generate(None, &[], Some(2), &params, None).unwrap();

        assert_eq!((out.batch(), out.codebooks(), out.steps()), (2, 3, 3));
        for b in 0..2 {
            for t in 0..3 {
                match out.get(b, 0, t) {
                    // the padding row id sits one past the text vocabulary
                    Token::Value(v) => assert!((v as usize) <= 8),
                    other => panic!("text step {t}: unexpected {other:?}"),
                }
                for k in 1..3 {
                    match out.get(b, k, t) {
                        Token::Value(v) => assert!((v as usize) < 16),
                        other => panic!("audio stream {k} step {t}: unexpected {other:?}"),
                    }
                }
            }
        }
    }

    #[test]
    fn test_repetition_penalty_rotates_greedy_choice() {
        let rig: &[(&str, Vec<f32>)] =
            &[("depth_decoder.heads.0.bias", vec![0.0, 10.0, 0.0, 0.0])];
        let base = LmConfig {
            bias_proj: true,
            depth_decoder: Some(small_depth()),
            repeat_penalty_length: 4.0,
            ..audio_config(1, 4, vec![0])
        };

        // without the penalty the bias wins every step
        let plain = rigged_model(base.clone(), rig);
        let out = plain.generate(None, &[], None, &greedy(4), None).unwrap();
        assert_eq!(stream(&out, 0, 0), vec![Token::Value(1); 4]);

        // with it, each pick inflates its own count and the argmax rotates
        // through the vocabulary as earlier penalties decay
        let penalized = rigged_model(
            LmConfig {
                repeat_penalty_coef: 100.0,
                ..base
            },
            rig,
        );
        let out = penalized
            .generate(None, &[], None, &greedy(4), None)
            .unwrap();
        assert_eq!(
            stream(&out, 0, 0),
            vec![
                Token::Value(1),
                Token::Value(0),
                Token::Value(2),
                Token::Value(3),
            ]
        );
    }
}

mod consistency_tests {
    use super::*;

    fn grid_tensor(model: &LmModel, grid: &TokenGrid) -> Tensor {
        grid.to_tensor(&model.config().stream_cardinalities(), model.device())
            .unwrap()
    }

    #[test]
    fn test_streaming_matches_full_prefix() {
        let model = random_model(audio_config(2, 16, vec![0, 0]));
        let grid = TokenGrid::from_rows(vec![vec![
            vec![
                Token::Value(1),
                Token::Value(2),
                Token::Value(3),
                Token::Value(4),
                Token::Value(5),
            ],
            vec![
                Token::Value(5),
                Token::Value(4),
                Token::Value(3),
                Token::Value(2),
                Token::Value(1),
            ],
        ]])
        .unwrap();

        let mut full_state = model.streaming_state();
        let full = model
            .step(
                &grid_tensor(&model, &grid),
                None,
                Modality::Audio,
                &mut full_state,
            )
            .unwrap();

        let mut state = model.streaming_state();
        let mut last = None;
        for t in 0..grid.steps() {
            let column = grid.slice_steps(t, 1).unwrap();
            last = Some(
                model
                    .step(
                        &grid_tensor(&model, &column),
                        None,
                        Modality::Audio,
                        &mut state,
                    )
                    .unwrap(),
            );
        }

        let full: Vec<f32> = full
            .audio
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let step: Vec<f32> = last
            .unwrap()
            .audio
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(full.len(), step.len());
        let worst = full
            .iter()
            .zip(&step)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(worst < 1e-4, "streaming drifted from the full prefix: {worst}");
    }

    #[test]
    fn test_same_seed_same_tokens() {
        let model = random_model(audio_config(2, 16, vec![0, 1]));
        let params = GenerateParams {
            policy: SamplingPolicy::TopK {
                k: 8,
                temperature: 0.9,
            },
            seed: Some(11),
            ..greedy(6)
        };
        let a = model.generate(None, &[], Some(1), &params, None).unwrap();
        let b = model.generate(None, &[], Some(1), &params, None).unwrap();
        assert_eq!(a, b);
    }
}

mod rejection_tests {
    use super::*;
    use std::collections::HashMap;

    use multistream_lm::{AttributeValue, CfgConditions};

    fn tiny_model() -> LmModel {
        rigged_model(audio_config(1, 4, vec![0]), &[])
    }

    fn err_of(result: anyhow::Result<TokenGrid>) -> String {
        format!("{:#}", result.unwrap_err())
    }

    #[test]
    fn test_zero_length_request_is_rejected() {
        let err = err_of(tiny_model().generate(None, &[], None, &greedy(0), None));
        assert!(err.contains("max_gen_len must be positive"), "{err}");
    }

    #[test]
    fn test_zero_samples_are_rejected() {
        let model = tiny_model();
        let err = err_of(model.generate_with_conditions(
            None,
            &CfgConditions::None,
            0,
            &greedy(2),
            None,
        ));
        assert!(err.contains("num_samples must be positive"), "{err}");
    }

    #[test]
    fn test_prompt_batch_mismatch_is_rejected() {
        let model = tiny_model();
        let prompt = TokenGrid::filled(2, 1, 1, Token::Value(0));
        let err = err_of(model.generate(Some(&prompt), &[], Some(1), &greedy(2), None));
        assert!(err.contains("prompt has batch size 2"), "{err}");
    }

    #[test]
    fn test_fully_decided_prompt_is_rejected() {
        let model = tiny_model();
        let prompt = TokenGrid::filled(1, 1, 2, Token::Value(0));
        let err = err_of(model.generate(Some(&prompt), &[], None, &greedy(2), None));
        assert!(err.contains("the prompt decides every position"), "{err}");
    }

    #[test]
    fn test_overlong_strip_is_rejected() {
        let model = tiny_model();
        let prompt = TokenGrid::filled(1, 1, 2, Token::Value(0));
        let params = GenerateParams {
            strip: 2,
            ..greedy(4)
        };
        let err = err_of(model.generate(Some(&prompt), &[], None, &params, None));
        assert!(err.contains("too short to strip"), "{err}");
    }

    #[test]
    fn test_overlong_prompt_is_rejected() {
        let model = tiny_model();
        let prompt = TokenGrid::filled(1, 1, 4, Token::Value(0));
        let err = err_of(model.generate(Some(&prompt), &[], None, &greedy(3), None));
        assert!(err.contains("exceeds max_gen_len"), "{err}");
    }

    #[test]
    fn test_window_overflow_is_rejected() {
        let config = LmConfig {
            backbone: small_backbone(8),
            ..audio_config(1, 4, vec![0])
        };
        let model = rigged_model(config, &[]);
        let err = err_of(model.generate(None, &[], None, &greedy(16), None));
        assert!(err.contains("exceeds the backbone's 8-position window"), "{err}");
    }

    #[test]
    fn test_text_modality_needs_a_text_stream() {
        let model = tiny_model();
        let params = GenerateParams {
            modality: Modality::Both,
            ..greedy(2)
        };
        let err = err_of(model.generate(None, &[], None, &params, None));
        assert!(err.contains("no text stream"), "{err}");
    }

    #[test]
    fn test_attributes_need_a_provider() {
        let model = tiny_model();
        let attrs = vec![HashMap::from([(
            "style".to_string(),
            AttributeValue::Text("bright".to_string()),
        )])];
        let err = err_of(model.generate(None, &attrs, None, &greedy(2), None));
        assert!(err.contains("no condition provider"), "{err}");
    }

    #[test]
    fn test_guidance_needs_conditions() {
        let model = tiny_model();
        let params = GenerateParams {
            cfg_coef: Some(3.0),
            ..greedy(2)
        };
        let err = err_of(model.generate(None, &[], None, &params, None));
        assert!(err.contains("conditional/null condition arrangement"), "{err}");
    }
}
