// useful helpers for tests
#[macro_export]
macro_rules! test_from_network {
    ($slice:ident, $t:ty) => {{
        let s = $crate::util::get_sample_slice($slice);
        let mut buffer = std::io::Cursor::new(s.as_slice());
        let mut v = <$t>::default();
        assert!(v.from_network_bytes(&mut buffer).is_ok());
        v
    }};
}

#[macro_export]
macro_rules! test_to_network {
    ($data:ident) => {{
        let mut writer = $crate::network_order::PacketWriter::new();
        let bytes_written = $data.to_network_bytes(&mut writer).unwrap();

        (writer.into_bytes(), bytes_written)
    }};
}
