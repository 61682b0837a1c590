use std::sync::Arc;

fn main() -> Result<(), style_transfer::Error> {
    // the frozen feature extractor, built once and shared
    let backbone = Arc::new(style_transfer::Backbone::vgg19(0));

    //create a new session
    let session = style_transfer::Session::builder()
        .backbone(backbone)
        //the image whose texture statistics we want to copy
        .style_image(&"imgs/style.jpg")
        //the image whose structure we want to keep
        .content_image(&"imgs/content.jpg")
        .build()?;

    //synthesize the stylized image
    let stylized = session.run(None)?;

    //save the image to the disk
    stylized.save("out/01.png")
}
