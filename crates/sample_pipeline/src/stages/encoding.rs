use rand::Rng;
use rand_distr::StandardNormal;

use crate::{
    config::SamplingMode,
    error::{PipelineError, Result},
    record::{Field, Record, Value},
    traits::{SampleContext, Stage},
    types::{LatentDistribution, Raster},
};

/// Value written into the region to inpaint; mid-grey in [-1, 1]
pub const CONDITIONING_FILL: f32 = 0.0;

/// Builds the conditioning image `image * (1 - m) + fill * m`, where the
/// mask is 1 over the region to inpaint.
#[derive(Debug, Clone)]
pub struct GenerateMaskedConditioningImage {
    pub image: Field,
    pub mask: Field,
    pub output: Field,
    pub fill: f32,
}

impl GenerateMaskedConditioningImage {
    pub fn new(image: Field, mask: Field, output: Field) -> Self {
        Self {
            image,
            mask,
            output,
            fill: CONDITIONING_FILL,
        }
    }
}

impl Stage for GenerateMaskedConditioningImage {
    fn name(&self) -> &'static str {
        "generate_masked_conditioning_image"
    }

    fn requires(&self) -> Vec<Field> {
        vec![self.image, self.mask]
    }

    fn produces(&self) -> Vec<Field> {
        vec![self.output]
    }

    fn apply(&self, record: &mut Record, _ctx: &mut SampleContext<'_>) -> Result<()> {
        let image = record.raster(self.name(), self.image)?;
        let mask = record.raster(self.name(), self.mask)?;
        if image.resolution() != mask.resolution() || mask.channels() != 1 {
            return Err(PipelineError::Shape(format!(
                "mask {}x{} cannot condition image {}",
                mask.channels(),
                mask.resolution(),
                image.resolution()
            )));
        }

        let plane = mask.plane(0);
        let len = plane.len();
        let data = image
            .data()
            .iter()
            .enumerate()
            .map(|(i, value)| {
                let m = plane[i % len];
                value * (1.0 - m) + self.fill * m
            })
            .collect();
        let conditioning = Raster::new(image.width(), image.height(), image.channels(), data)?;
        record.insert(self.output, Value::Raster(conditioning));
        Ok(())
    }
}

/// Encodes a raster into a latent distribution with the pipeline encoder
#[derive(Debug, Clone)]
pub struct EncodeLatent {
    pub input: Field,
    pub output: Field,
}

impl EncodeLatent {
    pub fn new(input: Field, output: Field) -> Self {
        Self { input, output }
    }
}

impl Stage for EncodeLatent {
    fn name(&self) -> &'static str {
        "encode_latent"
    }

    fn requires(&self) -> Vec<Field> {
        vec![self.input]
    }

    fn produces(&self) -> Vec<Field> {
        vec![self.output]
    }

    fn apply(&self, record: &mut Record, ctx: &mut SampleContext<'_>) -> Result<()> {
        let raster = record.raster(self.name(), self.input)?;
        let encoder = ctx.pipeline.encoder.as_ref();
        let distribution = encoder.encode(raster, ctx.device())?;

        let factor = encoder.downsample_factor();
        let expected = (
            raster.width() / factor,
            raster.height() / factor,
            encoder.latent_channels(),
        );
        let mean = &distribution.mean;
        if (mean.width(), mean.height(), mean.channels()) != expected {
            return Err(PipelineError::Collaborator {
                name: encoder.identity(),
                message: format!(
                    "latent {}x{} does not match {}x{}x{}",
                    mean.channels(),
                    mean.resolution(),
                    expected.2,
                    expected.0,
                    expected.1
                ),
            });
        }

        record.insert(self.output, Value::Distribution(distribution));
        Ok(())
    }
}

/// Area-averages an auxiliary raster down to latent resolution
#[derive(Debug, Clone)]
pub struct Downscale {
    pub input: Field,
    pub output: Field,
}

impl Downscale {
    pub fn new(input: Field, output: Field) -> Self {
        Self { input, output }
    }
}

impl Stage for Downscale {
    fn name(&self) -> &'static str {
        "downscale"
    }

    fn requires(&self) -> Vec<Field> {
        vec![self.input]
    }

    fn produces(&self) -> Vec<Field> {
        vec![self.output]
    }

    fn apply(&self, record: &mut Record, ctx: &mut SampleContext<'_>) -> Result<()> {
        let factor = ctx.pipeline.encoder.downsample_factor();
        let reduced = record.raster(self.name(), self.input)?.downscale_area(factor)?;
        record.insert(self.output, Value::Raster(reduced));
        Ok(())
    }
}

/// Converts the prompt into token ids
#[derive(Debug, Clone)]
pub struct Tokenize {
    pub input: Field,
    pub output: Field,
}

impl Tokenize {
    pub fn new(input: Field, output: Field) -> Self {
        Self { input, output }
    }
}

impl Stage for Tokenize {
    fn name(&self) -> &'static str {
        "tokenize"
    }

    fn requires(&self) -> Vec<Field> {
        vec![self.input]
    }

    fn produces(&self) -> Vec<Field> {
        vec![self.output]
    }

    fn apply(&self, record: &mut Record, ctx: &mut SampleContext<'_>) -> Result<()> {
        let text = record.text(self.name(), self.input)?;
        let tokens = ctx.pipeline.tokenizer.tokenize(text)?;
        record.insert(self.output, Value::Tokens(tokens));
        Ok(())
    }
}

/// Turns a latent distribution into a concrete latent
#[derive(Debug, Clone)]
pub struct SampleDistribution {
    pub input: Field,
    pub output: Field,
    pub mode: SamplingMode,
}

impl SampleDistribution {
    pub fn new(input: Field, output: Field, mode: SamplingMode) -> Self {
        Self { input, output, mode }
    }
}

/// Draw one latent from `distribution` according to `mode`
pub fn sample_latent<R: Rng>(
    distribution: &LatentDistribution,
    mode: SamplingMode,
    rng: &mut R,
) -> Result<Raster> {
    match mode {
        SamplingMode::Mean => Ok(distribution.mean.clone()),
        SamplingMode::Sample => {
            let mean = &distribution.mean;
            let data = mean
                .data()
                .iter()
                .zip(distribution.log_scale.data())
                .map(|(mu, log_scale)| {
                    let eps: f32 = rng.sample(StandardNormal);
                    mu + log_scale.exp() * eps
                })
                .collect();
            Raster::new(mean.width(), mean.height(), mean.channels(), data)
        }
    }
}

impl Stage for SampleDistribution {
    fn name(&self) -> &'static str {
        "sample_distribution"
    }

    fn requires(&self) -> Vec<Field> {
        vec![self.input]
    }

    fn produces(&self) -> Vec<Field> {
        vec![self.output]
    }

    fn apply(&self, record: &mut Record, ctx: &mut SampleContext<'_>) -> Result<()> {
        let distribution = record.distribution(self.name(), self.input)?;
        let latent = sample_latent(distribution, self.mode, &mut ctx.rng)?;
        record.insert(self.output, Value::Raster(latent));
        Ok(())
    }
}
