use dispatchq::io::FifoBuffer;

#[test]
fn dequeue_returns_what_is_available() {
    let mut fifo = FifoBuffer::new();
    fifo.enqueue(vec![1u8; 10]);

    let mut buffer = [0u8; 15];
    assert_eq!(fifo.dequeue_into(&mut buffer), 10, "only 10 bytes were enqueued");
    assert_eq!(&buffer[..10], &[1u8; 10]);
    assert_eq!(fifo.dequeue_into(&mut buffer), 0, "the buffer is drained");
    assert!(fifo.is_empty());
}

#[test]
fn dequeue_spans_segments_in_order() {
    let mut fifo = FifoBuffer::new();
    fifo.enqueue(&b"hello "[..]);
    fifo.enqueue(&b""[..]);
    fifo.enqueue(&b"world"[..]);
    assert_eq!(fifo.len(), 11);

    let mut buffer = [0u8; 8];
    assert_eq!(fifo.dequeue_into(&mut buffer), 8);
    assert_eq!(&buffer, b"hello wo");
    assert_eq!(fifo.len(), 3);

    assert_eq!(&fifo.take_all()[..], b"rld");
    assert!(fifo.is_empty());
}

#[test]
fn dequeue_by_length() {
    let mut fifo = FifoBuffer::new();
    fifo.enqueue(&b"abc"[..]);
    fifo.enqueue(&b"def"[..]);

    assert_eq!(&fifo.dequeue(2)[..], b"ab");
    assert_eq!(&fifo.dequeue(3)[..], b"cde");
    assert_eq!(&fifo.dequeue(10)[..], b"f");
    assert!(fifo.dequeue(1).is_empty());
}

#[test]
fn clear_discards_everything() {
    let mut fifo = FifoBuffer::new();
    fifo.enqueue(vec![0u8; 32]);
    fifo.clear();
    assert_eq!(fifo.len(), 0);

    let mut buffer = [0u8; 4];
    assert_eq!(fifo.dequeue_into(&mut buffer), 0);
}
