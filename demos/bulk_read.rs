use futures::StreamExt;
use http::{header, Request, Uri};
use hyper_bulkdocs::{Error, Operation, ReadEvent, Session};
use log::{debug, error, info};

#[tokio::main]
async fn main() {
    dotenv::dotenv().expect("Failed to initialize dotenv");
    pretty_env_logger::init();

    let url = std::env::var("BULKDOCS_URL").expect("BULKDOCS_URL must be set");
    let target_uri: Uri = url.parse().expect("Invalid bulk read URL");

    if let Err(e) = read(target_uri).await {
        error!("Error: {}", e);
    }
}

async fn read(target_uri: Uri) -> Result<(), Error> {
    let session = Session::new();
    let client = hyper::Client::new();

    let request = Request::get(target_uri)
        .header(header::ACCEPT, session.content_type())
        .body(hyper::Body::empty())
        .map_err(|e| Error::InnerStream(e.to_string()))?;

    let response = client.request(request).await?;
    info!("Response status: {}", response.status());

    let mut events = Operation::new("bulk read")
        .respond(&session, response)
        .stream();

    let mut documents = 0;
    while let Some(event) = events.next().await {
        match event? {
            ReadEvent::Document(doc) => {
                documents += 1;
                debug!("==========================================");
                debug!("Document: {:?} ({})", doc.uri, doc.format);
                if let Some(metadata) = doc.metadata {
                    debug!("Metadata: {:?}", metadata);
                }
            }
            ReadEvent::Summary(value) => info!("Summary: {}", value),
            ReadEvent::BinaryStart(doc) => {
                documents += 1;
                debug!("==========================================");
                debug!("Binary document: {:?}", doc.uri);
            }
            ReadEvent::BinaryChunk(chunk) => debug!("  {} bytes", chunk.len()),
            ReadEvent::BinaryEnd => debug!("  done"),
        }
    }

    info!("Read {} documents", documents);
    Ok(())
}
