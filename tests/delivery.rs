use bytes::Bytes;
use futures::{stream, Stream, StreamExt};
use http::StatusCode;
use hyper_bulkdocs::{
    Content, DocumentRecord, Error, Metadata, Operation, ReadEvent, Record, Session,
};
use serde_json::json;

fn response(
    session: &Session,
    status: u16,
    body: Bytes,
) -> http::Response<impl Stream<Item = Result<Bytes, Error>>> {
    let chunks: Vec<Result<Bytes, Error>> = body
        .chunks(2)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();

    http::Response::builder()
        .status(status)
        .header("content-type", session.content_type())
        .body(stream::iter(chunks))
        .unwrap()
}

fn batch(session: &Session) -> Bytes {
    let docs = vec![
        DocumentRecord::new("/a.json")
            .with_content(json!({"n": 1}))
            .with_metadata(Metadata::default().with_collections(vec!["c"])),
        DocumentRecord::new("/b.bin").with_content(Bytes::from_static(b"\x00\x01\x02\x03")),
        DocumentRecord::new("/c.txt").with_content("three"),
    ];
    session.writer().write_batch(&docs).unwrap()
}

#[tokio::test]
async fn buffered_and_streamed_delivery_agree() {
    let _ = pretty_env_logger::try_init();
    let session = Session::new();
    let op = Operation::new("read");

    let buffered = op
        .respond(&session, response(&session, 200, batch(&session)))
        .result()
        .await
        .unwrap();

    let mut streamed = Vec::new();
    let mut binary: Option<(DocumentRecord, Vec<u8>)> = None;
    let mut events = op
        .respond(&session, response(&session, 200, batch(&session)))
        .stream();

    while let Some(event) = events.next().await {
        match event.unwrap() {
            ReadEvent::Document(d) => streamed.push(Record::Document(d)),
            ReadEvent::Summary(v) => streamed.push(Record::Summary(v)),
            ReadEvent::BinaryStart(d) => binary = Some((d, Vec::new())),
            ReadEvent::BinaryChunk(c) => binary.as_mut().unwrap().1.extend_from_slice(&c),
            ReadEvent::BinaryEnd => {
                let (mut d, bytes) = binary.take().unwrap();
                d.content = Some(Content::Binary(Bytes::from(bytes)));
                streamed.push(Record::Document(d));
            }
        }
    }

    assert_eq!(3, buffered.len());
    assert_eq!(buffered, streamed);

    let uris: Vec<&str> = buffered
        .iter()
        .filter_map(|r| r.as_document())
        .filter_map(|d| d.uri.as_deref())
        .collect();
    assert_eq!(vec!["/a.json", "/b.bin", "/c.txt"], uris);
}

#[tokio::test]
async fn rejected_status_is_an_error_in_both_modes() {
    let session = Session::new();
    let op = Operation::new("read");

    let err = op
        .respond(&session, response(&session, 403, batch(&session)))
        .result()
        .await
        .unwrap_err();
    assert_eq!(Some(StatusCode::FORBIDDEN), err.status_code());

    let events: Vec<_> = op
        .respond(&session, response(&session, 403, batch(&session)))
        .stream()
        .collect()
        .await;
    assert_eq!(1, events.len());
    assert!(matches!(&events[0], Err(e) if e.is_status()));
}

#[tokio::test]
async fn truncated_response_fails_the_buffered_result() {
    let session = Session::new();
    let body = batch(&session);
    let truncated = body.slice(..body.len() - 10);

    let err = Operation::new("read")
        .respond(&session, response(&session, 200, truncated))
        .result()
        .await
        .unwrap_err();
    assert!(err.is_protocol(), "unexpected {:?}", err);
}

#[tokio::test]
async fn documents_skip_summaries() {
    let session = Session::new();
    let mut body = format!(
        "--{b}\r\nContent-Type: application/json\r\nContent-Disposition: inline\r\n\r\n{{\"total\":1}}\r\n",
        b = session.boundary()
    )
    .into_bytes();
    let docs = [DocumentRecord::new("/a.json").with_content(json!(true))];
    body.extend_from_slice(&session.writer().write_batch(&docs).unwrap());

    let docs = Operation::new("search")
        .respond(&session, response(&session, 200, Bytes::from(body)))
        .documents()
        .await
        .unwrap();

    assert_eq!(1, docs.len());
    assert_eq!(Some(Content::Json(json!(true))), docs[0].content);
}

#[tokio::test]
async fn boundaries_with_special_characters_read_back() {
    for boundary in &["a:b", "a=b", "a(b)", "a,b", "a/b", "a?b"] {
        let session = Session::with_boundary(boundary).unwrap();
        let docs = [DocumentRecord::new("/a.json").with_content(json!({"b": boundary}))];
        let body = session.writer().write_batch(&docs).unwrap();

        let mut headers = http::HeaderMap::new();
        headers.insert("content-type", session.content_type().parse().unwrap());
        let chunks: Vec<Result<Bytes, Error>> = vec![Ok(body)];

        let records = Operation::new("read")
            .require_documents(true)
            .respond_parts(&session, StatusCode::OK, &headers, stream::iter(chunks))
            .result()
            .await
            .unwrap();

        assert_eq!(vec![Record::Document(docs[0].clone())], records, "boundary {}", boundary);
    }
}
