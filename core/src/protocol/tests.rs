//! Codec round-trip and framing tests.

use bytes::{BufMut, Bytes, BytesMut};
use proptest::prelude::*;
use tokio_util::codec::{Decoder, Encoder};

use super::codec::{self, CodecError, FieldTable, FieldValue, FrameCodec};
use super::constants::*;
use super::frame::{BasicProperties, ContentHeader, Frame, FrameType};
use super::methods::*;

fn roundtrip(method: Method) -> Method {
    let bytes = method.encode().expect("encode");
    Method::decode(bytes).expect("decode")
}

fn short_string() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9._-]{0,255}"
}

fn field_table() -> impl Strategy<Value = FieldTable> {
    let leaf = prop_oneof![
        any::<bool>().prop_map(FieldValue::Bool),
        any::<i8>().prop_map(FieldValue::I8),
        any::<i16>().prop_map(FieldValue::I16),
        any::<i32>().prop_map(FieldValue::I32),
        any::<i64>().prop_map(FieldValue::I64),
        ".{0,64}".prop_map(FieldValue::LongString),
        Just(FieldValue::Void),
    ];
    let value = leaf.prop_recursive(2, 16, 4, |inner| {
        prop::collection::btree_map("[a-z]{1,8}", inner, 0..4).prop_map(FieldValue::Table)
    });
    prop::collection::btree_map("[a-z_]{1,16}", value, 0..6)
}

proptest! {
    #[test]
    fn test_queue_declare_roundtrip(
        queue in short_string(),
        bits in any::<[bool; 5]>(),
        arguments in field_table(),
    ) {
        let method = Method::Queue(QueueMethod::Declare(QueueDeclare {
            queue,
            passive: bits[0],
            durable: bits[1],
            exclusive: bits[2],
            auto_delete: bits[3],
            no_wait: bits[4],
            arguments,
        }));
        prop_assert_eq!(roundtrip(method.clone()), method);
    }

    #[test]
    fn test_exchange_declare_roundtrip(
        exchange in short_string(),
        kind in prop_oneof![Just("direct"), Just("fanout"), Just("headers")],
        bits in any::<[bool; 5]>(),
        arguments in field_table(),
    ) {
        let method = Method::Exchange(ExchangeMethod::Declare(ExchangeDeclare {
            exchange,
            kind: kind.to_string(),
            passive: bits[0],
            durable: bits[1],
            auto_delete: bits[2],
            internal: bits[3],
            no_wait: bits[4],
            arguments,
        }));
        prop_assert_eq!(roundtrip(method.clone()), method);
    }

    #[test]
    fn test_deliver_roundtrip(
        consumer_tag in short_string(),
        delivery_tag in any::<u64>(),
        redelivered in any::<bool>(),
        exchange in short_string(),
        routing_key in short_string(),
    ) {
        let method = Method::Basic(BasicMethod::Deliver(BasicDeliver {
            consumer_tag,
            delivery_tag,
            redelivered,
            exchange,
            routing_key,
        }));
        prop_assert_eq!(roundtrip(method.clone()), method);
    }

    #[test]
    fn test_publish_and_return_roundtrip(
        exchange in short_string(),
        routing_key in short_string(),
        mandatory in any::<bool>(),
        immediate in any::<bool>(),
        reply_code in any::<u16>(),
        reply_text in short_string(),
    ) {
        let publish = Method::Basic(BasicMethod::Publish(BasicPublish {
            exchange: exchange.clone(),
            routing_key: routing_key.clone(),
            mandatory,
            immediate,
        }));
        prop_assert_eq!(roundtrip(publish.clone()), publish);

        let ret = Method::Basic(BasicMethod::Return(BasicReturn {
            reply_code,
            reply_text,
            exchange,
            routing_key,
        }));
        prop_assert_eq!(roundtrip(ret.clone()), ret);
    }

    #[test]
    fn test_ack_nack_roundtrip(tag in any::<u64>(), multiple in any::<bool>(), requeue in any::<bool>()) {
        let ack = Method::Basic(BasicMethod::Ack(BasicAck { delivery_tag: tag, multiple }));
        prop_assert_eq!(roundtrip(ack.clone()), ack);
        let nack = Method::Basic(BasicMethod::Nack(BasicNack { delivery_tag: tag, multiple, requeue }));
        prop_assert_eq!(roundtrip(nack.clone()), nack);
    }

    #[test]
    fn test_close_roundtrip(code in any::<u16>(), text in short_string(), class_id in any::<u16>(), method_id in any::<u16>()) {
        let close = Close { reply_code: code, reply_text: text, class_id, method_id };
        let conn = Method::Connection(ConnectionMethod::Close(close.clone()));
        prop_assert_eq!(roundtrip(conn.clone()), conn);
        let chan = Method::Channel(ChannelMethod::Close(close));
        prop_assert_eq!(roundtrip(chan.clone()), chan);
    }

    #[test]
    fn test_start_roundtrip(
        server_properties in field_table(),
        mechanisms in ".{0,300}",
        locales in ".{0,32}",
    ) {
        let start = Method::Connection(ConnectionMethod::Start(ConnectionStart {
            version_major: 0,
            version_minor: 9,
            server_properties,
            mechanisms,
            locales,
        }));
        prop_assert_eq!(roundtrip(start.clone()), start);
    }

    #[test]
    fn test_header_roundtrip(
        body_size in any::<u64>(),
        content_type in proptest::option::of(short_string()),
        delivery_mode in proptest::option::of(1u8..=2),
        priority in proptest::option::of(0u8..=9),
        timestamp in proptest::option::of(any::<u64>()),
        headers in proptest::option::of(field_table()),
    ) {
        let properties = BasicProperties {
            content_type,
            delivery_mode,
            priority,
            timestamp,
            headers,
            ..Default::default()
        };
        let header = ContentHeader::new(body_size, properties);
        let decoded = ContentHeader::decode(header.encode().unwrap()).unwrap();
        prop_assert_eq!(decoded, header);
    }
}

/// One instance of every method in the catalog.
fn catalog() -> Vec<Method> {
    vec![
        Method::Connection(ConnectionMethod::Start(ConnectionStart {
            version_major: 0,
            version_minor: 9,
            server_properties: FieldTable::new(),
            mechanisms: MECHANISM_PLAIN.into(),
            locales: "en_US".into(),
        })),
        Method::Connection(ConnectionMethod::StartOk(ConnectionStartOk {
            client_properties: FieldTable::new(),
            mechanism: MECHANISM_PLAIN.into(),
            response: "\0guest\0guest".into(),
            locale: "en_US".into(),
        })),
        Method::Connection(ConnectionMethod::Open(ConnectionOpen {
            virtual_host: "/".into(),
        })),
        Method::Connection(ConnectionMethod::OpenOk),
        Method::Connection(ConnectionMethod::Close(Close::normal())),
        Method::Connection(ConnectionMethod::CloseOk),
        Method::Channel(ChannelMethod::Open),
        Method::Channel(ChannelMethod::OpenOk),
        Method::Channel(ChannelMethod::Flow(Flow { active: false })),
        Method::Channel(ChannelMethod::FlowOk(Flow { active: true })),
        Method::Channel(ChannelMethod::Close(Close::normal())),
        Method::Channel(ChannelMethod::CloseOk),
        Method::Exchange(ExchangeMethod::Declare(ExchangeDeclare {
            exchange: "logs".into(),
            kind: "fanout".into(),
            ..Default::default()
        })),
        Method::Exchange(ExchangeMethod::DeclareOk),
        Method::Exchange(ExchangeMethod::Delete(ExchangeDelete {
            exchange: "logs".into(),
            if_unused: true,
            no_wait: false,
        })),
        Method::Exchange(ExchangeMethod::DeleteOk),
        Method::Exchange(ExchangeMethod::Bind(ExchangeBind {
            destination: "a".into(),
            source: "b".into(),
            routing_key: "k".into(),
            ..Default::default()
        })),
        Method::Exchange(ExchangeMethod::BindOk),
        Method::Exchange(ExchangeMethod::Unbind(ExchangeBind::default())),
        Method::Exchange(ExchangeMethod::UnbindOk),
        Method::Queue(QueueMethod::Declare(QueueDeclare {
            queue: "jobs".into(),
            durable: true,
            ..Default::default()
        })),
        Method::Queue(QueueMethod::DeclareOk(QueueDeclareOk {
            queue: "jobs".into(),
            message_count: 7,
            consumer_count: 2,
        })),
        Method::Queue(QueueMethod::Bind(QueueBind {
            queue: "jobs".into(),
            exchange: "amq.direct".into(),
            routing_key: "jobs".into(),
            ..Default::default()
        })),
        Method::Queue(QueueMethod::BindOk),
        Method::Queue(QueueMethod::Unbind(QueueUnbind {
            queue: "jobs".into(),
            exchange: "amq.direct".into(),
            routing_key: "jobs".into(),
            arguments: FieldTable::new(),
        })),
        Method::Queue(QueueMethod::UnbindOk),
        Method::Queue(QueueMethod::Delete(QueueDelete {
            queue: "jobs".into(),
            if_unused: false,
            if_empty: true,
            no_wait: false,
        })),
        Method::Queue(QueueMethod::DeleteOk(QueueDeleteOk { message_count: 3 })),
        Method::Basic(BasicMethod::Consume(BasicConsume {
            queue: "jobs".into(),
            consumer_tag: "worker".into(),
            no_ack: true,
            ..Default::default()
        })),
        Method::Basic(BasicMethod::ConsumeOk(ConsumerTag {
            consumer_tag: "worker".into(),
        })),
        Method::Basic(BasicMethod::Cancel(BasicCancel {
            consumer_tag: "worker".into(),
            no_wait: false,
        })),
        Method::Basic(BasicMethod::CancelOk(ConsumerTag {
            consumer_tag: "worker".into(),
        })),
        Method::Basic(BasicMethod::Publish(BasicPublish::default())),
        Method::Basic(BasicMethod::Return(BasicReturn::default())),
        Method::Basic(BasicMethod::Deliver(BasicDeliver::default())),
        Method::Basic(BasicMethod::Ack(BasicAck::default())),
        Method::Basic(BasicMethod::Nack(BasicNack::default())),
        Method::Tx(TxMethod::Select),
        Method::Tx(TxMethod::SelectOk),
        Method::Tx(TxMethod::Commit),
        Method::Tx(TxMethod::CommitOk),
        Method::Tx(TxMethod::Rollback),
        Method::Tx(TxMethod::RollbackOk),
    ]
}

#[test]
fn test_every_method_roundtrips_and_is_registered() {
    let methods = catalog();
    assert_eq!(methods.len(), METHOD_TABLE.len());
    for method in methods {
        let (class_id, method_id) = method.id();
        let entry = lookup(class_id, method_id).expect("registered");
        assert_eq!(method.name(), entry.name);
        assert_eq!(roundtrip(method.clone()), method, "{}", method.name());
    }
}

#[test]
fn test_wire_ids_are_fixed() {
    let consume = Method::Basic(BasicMethod::Consume(BasicConsume::default()));
    assert_eq!(consume.id(), (50, 10));
    assert_eq!(Method::Tx(TxMethod::RollbackOk).id(), (60, 31));
    assert_eq!(
        Method::Exchange(ExchangeMethod::UnbindOk).id(),
        (30, 41)
    );
    let bytes = consume.encode().unwrap();
    assert_eq!(&bytes[..4], &[0, 50, 0, 10]);
}

#[test]
fn test_wait_semantics() {
    let declare = QueueDeclare {
        queue: "q".into(),
        ..Default::default()
    };
    assert!(Method::Queue(QueueMethod::Declare(declare.clone())).wait());
    let no_wait = QueueDeclare {
        no_wait: true,
        ..declare
    };
    assert!(!Method::Queue(QueueMethod::Declare(no_wait)).wait());

    assert!(!Method::Basic(BasicMethod::Publish(BasicPublish::default())).wait());
    assert!(!Method::Basic(BasicMethod::Deliver(BasicDeliver::default())).wait());
    assert!(!Method::Basic(BasicMethod::Ack(BasicAck::default())).wait());
    assert!(!Method::Channel(ChannelMethod::OpenOk).wait());
    assert!(Method::Channel(ChannelMethod::Open).wait());
    assert!(Method::Tx(TxMethod::Commit).wait());

    let open = Method::Channel(ChannelMethod::Open);
    assert!(open.is_reply(&Method::Channel(ChannelMethod::OpenOk)));
    assert!(!open.is_reply(&Method::Channel(ChannelMethod::CloseOk)));
}

#[test]
fn test_content_methods() {
    assert!(Method::Basic(BasicMethod::Publish(BasicPublish::default())).has_content());
    assert!(Method::Basic(BasicMethod::Return(BasicReturn::default())).has_content());
    assert!(Method::Basic(BasicMethod::Deliver(BasicDeliver::default())).has_content());
    assert!(!Method::Basic(BasicMethod::Ack(BasicAck::default())).has_content());
}

#[test]
fn test_unknown_class_method_is_rejected() {
    let mut buf = BytesMut::new();
    buf.put_u16(50);
    buf.put_u16(99);
    let err = Method::decode(buf.freeze()).unwrap_err();
    assert!(matches!(err, CodecError::BadClassMethod(50, 99)));

    let protocol: super::ProtocolError = err.into();
    assert!(protocol.is_hard());
    assert_eq!(protocol.code, COMMAND_INVALID);
}

#[test]
fn test_short_string_boundaries() {
    for len in [0usize, 255] {
        let value = "x".repeat(len);
        let mut buf = BytesMut::new();
        codec::put_short_string(&mut buf, &value).unwrap();
        assert_eq!(buf.len(), len + 1);
        let mut bytes = buf.freeze();
        assert_eq!(codec::get_short_string(&mut bytes).unwrap(), value);
    }

    let mut buf = BytesMut::new();
    let err = codec::put_short_string(&mut buf, &"x".repeat(256)).unwrap_err();
    assert!(matches!(err, CodecError::StringTooLong(256)));

    // a 256-byte value is fine as a long string
    let value = "y".repeat(256);
    let mut buf = BytesMut::new();
    codec::put_long_string(&mut buf, &value);
    let mut bytes = buf.freeze();
    assert_eq!(codec::get_long_string(&mut bytes).unwrap(), value);
}

#[test]
fn test_truncated_payload() {
    let method = Method::Queue(QueueMethod::Declare(QueueDeclare {
        queue: "orders".into(),
        ..Default::default()
    }));
    let bytes = method.encode().unwrap();
    let cut = bytes.slice(..bytes.len() - 2);
    assert!(matches!(
        Method::decode(cut),
        Err(CodecError::Truncated { .. })
    ));
}

#[test]
fn test_bit_packing_is_lsb_first() {
    assert_eq!(codec::pack_bits(&[true, false, true]), 0b0000_0101);
    let bits = codec::unpack_bits(0b0001_0010);
    assert_eq!(bits[..5], [false, true, false, false, true]);
}

#[test]
fn test_frame_codec_roundtrip() {
    let mut codec = FrameCodec::new(4096);
    let frame = Frame::method(3, &Method::Channel(ChannelMethod::Open)).unwrap();
    let mut buf = BytesMut::new();
    codec.encode(frame.clone(), &mut buf).unwrap();

    assert_eq!(buf[0], FRAME_METHOD);
    assert_eq!(&buf[1..3], &[0, 3]);
    assert_eq!(*buf.last().unwrap(), FRAME_END);

    // partial input yields nothing until the frame is complete
    let mut partial = buf.split_to(5);
    assert!(codec.decode(&mut partial).unwrap().is_none());
    partial.unsplit(buf);
    let decoded = codec.decode(&mut partial).unwrap().unwrap();
    assert_eq!(decoded, frame);
    assert!(partial.is_empty());
}

#[test]
fn test_frame_codec_bad_end_marker() {
    let mut codec = FrameCodec::new(4096);
    let mut buf = BytesMut::new();
    codec
        .encode(Frame::body(1, Bytes::from_static(b"abc")), &mut buf)
        .unwrap();
    let last = buf.len() - 1;
    buf[last] = 0x00;
    let err = codec.decode(&mut buf).unwrap_err();
    assert!(matches!(err, CodecError::BadFrameEnd(0x00)));
    let protocol: super::ProtocolError = err.into();
    assert_eq!(protocol.code, FRAME_ERROR);
}

#[test]
fn test_frame_codec_unknown_type() {
    let mut codec = FrameCodec::new(4096);
    let mut buf = BytesMut::from(&[9u8, 0, 1, 0, 0, 0, 0, FRAME_END][..]);
    assert!(matches!(
        codec.decode(&mut buf),
        Err(CodecError::BadFrameType(9))
    ));
}

#[test]
fn test_frame_codec_rejects_oversized() {
    let mut codec = FrameCodec::new(4096);
    let mut buf = BytesMut::new();
    let body = Bytes::from(vec![0u8; 5000]);
    assert!(matches!(
        codec.encode(Frame::body(1, body), &mut buf),
        Err(CodecError::FrameTooLarge { .. })
    ));

    let mut header = BytesMut::new();
    header.put_u8(FRAME_BODY);
    header.put_u16(1);
    header.put_u32(10_000);
    assert!(matches!(
        codec.decode(&mut header),
        Err(CodecError::FrameTooLarge { .. })
    ));
}

#[test]
fn test_content_is_split_by_frame_max() {
    let method = Method::Basic(BasicMethod::Deliver(BasicDeliver::default()));
    let body = Bytes::from(vec![7u8; 10_000]);
    let header = ContentHeader::new(body.len() as u64, BasicProperties::default());
    let frames = Frame::content(1, &method, &header, &body, 4096).unwrap();

    assert_eq!(frames[0].frame_type, FrameType::Method);
    assert_eq!(frames[1].frame_type, FrameType::Header);
    let bodies: Vec<_> = frames[2..].iter().map(|f| f.payload.len()).collect();
    assert_eq!(bodies, vec![4088, 4088, 1824]);

    let empty = Frame::content(1, &method, &ContentHeader::new(0, Default::default()), &Bytes::new(), 4096).unwrap();
    assert_eq!(empty.len(), 2);
}

#[test]
fn test_properties_flags() {
    let props = BasicProperties::default()
        .with_content_type("application/json")
        .with_delivery_mode(2)
        .with_header("x-trace", "abc");
    let header = ContentHeader::new(12, props.clone());
    let mut payload = header.encode().unwrap();
    assert_eq!(codec::get_short(&mut payload).unwrap(), CLASS_BASIC);
    assert_eq!(codec::get_short(&mut payload).unwrap(), 0);
    assert_eq!(codec::get_longlong(&mut payload).unwrap(), 12);
    let flags = codec::get_short(&mut payload).unwrap();
    // content-type, headers, delivery-mode
    assert_eq!(flags, (1 << 15) | (1 << 13) | (1 << 12));

    let decoded = ContentHeader::decode(header.encode().unwrap()).unwrap();
    assert_eq!(decoded.properties, props);
}
