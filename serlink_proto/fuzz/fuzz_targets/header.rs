#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use serlink_proto::FragmentHeader;

fuzz_target!(|data: &[u8]| {
    let mut src = data;
    if let Some(header) = FragmentHeader::decode(&mut src) {
        let mut buf = BytesMut::with_capacity(FragmentHeader::SIZE);
        header.encode(&mut buf);
        assert_eq!(&data[..FragmentHeader::SIZE], &buf[..]);
    }
});
