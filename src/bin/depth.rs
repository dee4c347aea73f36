use clap::Parser;
use t2i_adapter::{
    adapter::T2IAdapter,
    cli::DepthArgs,
    condition::ConditionSource,
    depth::{DepthEstimator, MidasDepth},
    ldm::LdmBuilder,
    output::OutputWriter,
    pipeline::{DepthFlow, Pipeline},
    utils::init_tracing,
};

fn main() -> anyhow::Result<()> {
    let args = DepthArgs::parse();
    let _guard = init_tracing(args.common.tracing);
    let (options, inputs) = args.resolve()?;
    tracing::info!(device = ?options.device, sampler = ?options.sampler, "starting depth generation");

    let config = options.model_config()?;
    let model = LdmBuilder::new(config.clone(), options.device)
        .with_vae(options.ckpt_vae.as_ref())
        .from_repo(&options.ckpt)?;
    let adapter = T2IAdapter::load(&args.ckpt_ad, 3, config.model_kind.unet_levels(), options.device)?;
    let estimator = match inputs.source {
        ConditionSource::Image => Some(MidasDepth::load(&args.depth_model, options.device)?),
        ConditionSource::Depth => None,
    };
    let sampler = options.sampler.build(config.noise_schedule());

    let flow = DepthFlow {
        pipeline: Pipeline {
            model: &model,
            adapter: &adapter,
            sampler: sampler.as_ref(),
            params: &options.params,
        },
        estimator: estimator.as_ref().map(|e| e as &dyn DepthEstimator),
    };
    let mut writer = OutputWriter::new(&args.outdir)?;
    flow.run(&inputs, &mut writer)
}
