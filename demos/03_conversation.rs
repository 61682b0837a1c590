use std::{path::Path, sync::Arc};
use style_transfer as st;
use style_transfer::conversation::{ConversationTracker, Reply};

/// Walks one requester through the two-upload exchange a messaging front end
/// would drive, then runs the transfer with the collected paths.
fn main() -> Result<(), st::Error> {
    let backbone = Arc::new(st::Backbone::vgg19(0));
    let mut tracker = ConversationTracker::new();

    // a message arrives from a new requester
    let reply = tracker.begin("alice");
    assert_eq!(reply, Reply::PromptForStyle);
    println!("bot: please send the style image");

    // the front end saved their first upload and hands over the path
    let reply = tracker.image_received("alice", "imgs/style.jpg".into());
    assert_eq!(reply, Reply::PromptForContent);
    println!("bot: got it, now send the content image");

    // the second upload completes the exchange
    let reply = tracker.image_received("alice", "imgs/content.jpg".into());
    if let Reply::RunTransfer { style, content } = reply {
        println!("bot: working on it...");
        st::stylize(
            backbone,
            style.as_path(),
            content.as_path(),
            Path::new("out/03.png"),
        )?;
        tracker.completed("alice");
        println!("bot: done, your stylized image is at out/03.png");
    }

    Ok(())
}
