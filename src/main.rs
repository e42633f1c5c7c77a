use anyhow::{Context, Result, ensure};
use burn::{
    backend::NdArray,
    config::Config,
    prelude::Backend,
    tensor::{Tensor, TensorData},
};
use serde::{Deserialize, Serialize};
use ssd_multibox::{
    anchors::AnchorGenerator,
    config::{Commands, SsdCmd, SsdConfig, SubCommandDetect},
    decoder::BoxDecoder,
    labels::ClassNames,
    nms::{Detection, DetectionSelector},
};
use tracing::info;

/// Raw head outputs of one image, already flattened in anchor order.
#[derive(Deserialize)]
struct RawPredictions {
    class_logits: Vec<Vec<f32>>,
    offsets: Vec<[f32; 4]>,
}

#[derive(Serialize)]
struct NamedDetection<'a> {
    label: &'a str,
    #[serde(flatten)]
    detection: Detection,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    type B = NdArray<f32>;
    let device = burn::backend::ndarray::NdArrayDevice::default();

    let cli_cmd: SsdCmd = argh::from_env();

    let config = match &cli_cmd.config {
        Some(path) => SsdConfig::load(path).with_context(|| format!("loading config {path}"))?,
        None => SsdConfig::new(),
    };
    config.validate()?;

    match cli_cmd.commands {
        Commands::Anchors(_) => print_anchor_table(&config),
        Commands::Detect(sub_command_detect) => {
            detect::<B>(config, &sub_command_detect, &device)
        }
    }
}

fn print_anchor_table(config: &SsdConfig) -> Result<()> {
    let generator = AnchorGenerator::new(&config.anchors)?;
    let ranges = generator.layer_ranges();

    println!(
        "{:<9} {:>7} {:>9} {:>7} {:>13}  sizes (h x w)",
        "layer", "grid", "templates", "scale", "anchors"
    );

    for set in generator.generate_all() {
        let [rows, cols] = set.feature_map;
        let range = &ranges[set.layer];
        let sizes: Vec<String> = set
            .heights
            .iter()
            .zip(&set.widths)
            .map(|(h, w)| format!("{h:.3}x{w:.3}"))
            .collect();

        println!(
            "{:<9} {:>7} {:>9} {:>7.4} {:>13}  {}",
            set.layer.name(),
            format!("{rows}x{cols}"),
            set.num_templates(),
            generator.scales().get(set.layer.index()),
            format!("{}..{}", range.start, range.end),
            sizes.join(" ")
        );
    }

    println!("total anchors: {}", generator.total_anchors());
    Ok(())
}

fn detect<B: Backend>(
    config: SsdConfig,
    cmd: &SubCommandDetect,
    device: &B::Device,
) -> Result<()> {
    let file = std::fs::read_to_string(&cmd.p).with_context(|| format!("reading {}", cmd.p))?;
    let raw: RawPredictions = serde_json::from_str(&file).context("parsing predictions")?;

    let n = raw.class_logits.len();
    let k = config.num_classes;
    ensure!(
        raw.class_logits.iter().all(|row| row.len() == k),
        "every class_logits row must hold {k} values"
    );

    let logits: Vec<f32> = raw.class_logits.into_iter().flatten().collect();
    let offsets: Vec<f32> = raw.offsets.iter().flatten().copied().collect();
    let logits = Tensor::<B, 2>::from_data(TensorData::new(logits, [n, k]), device);
    let offsets =
        Tensor::<B, 2>::from_data(TensorData::new(offsets, [raw.offsets.len(), 4]), device);

    let mut detection = config.detection.clone();
    if let Some(iou) = cmd.i {
        detection.nms_threshold = iou;
    }
    if let Some(score) = cmd.c {
        detection.score_threshold = score;
    }

    let decoder = BoxDecoder::<B>::from_config(&config, device)?;
    let selector = DetectionSelector::new(detection)?;
    let detections = selector.detect(&decoder, logits, offsets)?;

    let names = if k == ClassNames::voc().count() {
        ClassNames::voc()
    } else {
        ClassNames::numbered(k)
    };

    info!(detections = detections.len(), "done");

    for detection in detections {
        let named = NamedDetection {
            label: names.name(detection.class_id).unwrap_or("unknown"),
            detection,
        };
        println!("{}", serde_json::to_string(&named)?);
    }

    Ok(())
}
