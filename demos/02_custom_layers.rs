use std::sync::Arc;
use style_transfer as st;

fn main() -> Result<(), st::Error> {
    let backbone = Arc::new(st::Backbone::vgg19(0));

    let session = st::Session::builder()
        .backbone(backbone)
        .style_image(&"imgs/style.jpg")
        .content_image(&"imgs/content.jpg")
        // measure content agreement deeper in the network, and style on
        // fewer, earlier layers than the defaults
        .content_layers(vec!["conv_5"])
        .style_layers(vec!["conv_1", "conv_2", "conv_3"])
        // push the balance further toward texture
        .style_weight(5e6)
        .num_steps(500)
        .image_size(256)
        .build()?;

    // watch the loss terms fall as the canvas converges
    let progress: Box<dyn st::TransferProgress> = Box::new(|info: st::session::ProgressUpdate| {
        if info.step % 50 == 0 {
            println!(
                "step {:>4}/{}: style {:.4} content {:.4}",
                info.step, info.total_steps, info.style_score, info.content_score
            );
        }
    });

    let stylized = session.run(Some(progress))?;

    stylized.save("out/02.png")
}
