use clap::Parser;
use t2i_adapter::{
    adapter::T2IAdapter,
    cli::SketchEditArgs,
    ldm::LdmBuilder,
    output::OutputWriter,
    pipeline::{Pipeline, SketchEditFlow},
    utils::init_tracing,
};

fn main() -> anyhow::Result<()> {
    let args = SketchEditArgs::parse();
    let _guard = init_tracing(args.common.tracing);
    let (options, inputs) = args.resolve()?;
    tracing::info!(device = ?options.device, sampler = ?options.sampler, "starting sketch edit");

    let config = options.model_config()?;
    let model = LdmBuilder::new(config.clone(), options.device)
        .with_vae(options.ckpt_vae.as_ref())
        .from_repo(&options.ckpt)?;
    let adapter = T2IAdapter::load(&args.ckpt_ad, 1, config.model_kind.unet_levels(), options.device)?;
    let sampler = options.sampler.build(config.noise_schedule());

    let flow = SketchEditFlow {
        pipeline: Pipeline {
            model: &model,
            adapter: &adapter,
            sampler: sampler.as_ref(),
            params: &options.params,
        },
    };
    let mut writer = OutputWriter::new(&args.outdir)?;
    flow.run(&inputs, &mut writer)
}
