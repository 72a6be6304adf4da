use crate::buffer::PersistentBuffer;


/// Exercises the accessor surface shared by every buffer variant.
pub(crate) fn exercise_buffer<B: PersistentBuffer>(buffer: &mut B) {
    assert_eq!(buffer.capacity().expect("capacity should not fail"), 0);

    buffer.set_capacity(8192).expect("grow should not fail");
    assert_eq!(buffer.capacity().expect("capacity should not fail"), 8192);

    // Growth reads zero everywhere.
    let mut contents = vec![0xAAu8; 8192];
    buffer
        .get(0, &mut contents)
        .expect("read should not fail");
    assert!(contents.iter().all(|&b| b == 0));

    // Byte and integer accessors are big-endian and round-trip.
    buffer.put(100, b"hello").expect("put should not fail");
    let mut hello = [0u8; 5];
    buffer.get(100, &mut hello).expect("get should not fail");
    assert_eq!(&hello, b"hello");

    buffer
        .put_i64(200, -2)
        .expect("put_i64 should not fail");
    assert_eq!(buffer.get_i64(200).expect("get_i64 should not fail"), -2);
    let mut raw = [0u8; 8];
    buffer.get(200, &mut raw).expect("get should not fail");
    assert_eq!(raw, [0xFF; 8], "i64 -2 must be stored big-endian");

    buffer.put_i32(300, 0x0102_0304).expect("put_i32 should not fail");
    assert_eq!(buffer.get_byte(300).expect("get_byte should not fail"), 1);
    assert_eq!(buffer.get_byte(303).expect("get_byte should not fail"), 4);
    assert_eq!(
        buffer.get_i32(300).expect("get_i32 should not fail"),
        0x0102_0304
    );

    buffer.put_byte(400, 1).expect("put_byte should not fail");
    assert!(buffer.get_bool(400).expect("get_bool should not fail"));
    assert!(!buffer.get_bool(401).expect("get_bool should not fail"));

    // Partial reads stop at capacity; full reads past it fail.
    let mut tail = [0u8; 16];
    let read = buffer
        .get_some(8192 - 4, &mut tail)
        .expect("get_some should not fail");
    assert_eq!(read, 4);
    assert_eq!(
        buffer.get_some(9000, &mut tail).expect("get_some should not fail"),
        0
    );
    assert!(buffer.get(8192 - 4, &mut tail).is_err());
    assert!(buffer.put(8190, &[0u8; 4]).is_err());

    // Shrink then re-grow: the re-exposed region reads zero.
    buffer.put(4096, &[0x55; 64]).expect("put should not fail");
    buffer.set_capacity(4096).expect("shrink should not fail");
    buffer.set_capacity(8192).expect("re-grow should not fail");
    let mut regrown = [0xAAu8; 64];
    buffer.get(4096, &mut regrown).expect("get should not fail");
    assert!(
        regrown.iter().all(|&b| b == 0),
        "re-grown region must read zero"
    );

    // Bounded streams.
    {
        use std::io::Write;
        let mut out = buffer.output_stream(500, 4);
        out.write_all(b"abcd").expect("stream write should not fail");
        assert!(
            out.write_all(b"e").is_err(),
            "write past window must fail deterministically"
        );
    }
    {
        use std::io::Read;
        let mut input = buffer.input_stream(500, 4);
        let mut window = Vec::new();
        input
            .read_to_end(&mut window)
            .expect("stream read should not fail");
        assert_eq!(window, b"abcd");
    }

    buffer.barrier(false).expect("barrier should not fail");
    buffer.barrier(true).expect("forced barrier should not fail");
}
