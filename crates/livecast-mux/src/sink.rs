//! Destinations for muxed transport packets.

/// Receives the multiplexer's output.
pub trait TsSink {
    /// Consume one packet (188 bytes, or 4 bytes of M2TS arrival time).
    fn write(&mut self, data: &[u8]);

    /// Called after the last packet of every PES. Sinks that batch
    /// packets use it to flush.
    fn end_of_pes(&mut self) {}
}

impl TsSink for Vec<u8> {
    fn write(&mut self, data: &[u8]) {
        self.extend_from_slice(data);
    }
}

impl<S: TsSink + ?Sized> TsSink for &mut S {
    fn write(&mut self, data: &[u8]) {
        (**self).write(data);
    }

    fn end_of_pes(&mut self) {
        (**self).end_of_pes();
    }
}

impl<S: TsSink + ?Sized> TsSink for Box<S> {
    fn write(&mut self, data: &[u8]) {
        (**self).write(data);
    }

    fn end_of_pes(&mut self) {
        (**self).end_of_pes();
    }
}

/// Adapts a closure into a sink.
pub struct FnSink<F>(pub F);

impl<F: FnMut(&[u8])> TsSink for FnSink<F> {
    fn write(&mut self, data: &[u8]) {
        (self.0)(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_sink_sees_every_write() {
        let mut total = 0usize;
        {
            let mut sink = FnSink(|data: &[u8]| total += data.len());
            sink.write(&[0x47; 188]);
            sink.write(&[0x47; 188]);
            sink.end_of_pes();
        }
        assert_eq!(total, 376);
    }

    #[test]
    fn test_vec_sink_appends() {
        let mut buf = Vec::new();
        {
            let mut sink: &mut Vec<u8> = &mut buf;
            TsSink::write(&mut sink, &[1, 2]);
        }
        TsSink::write(&mut buf, &[3]);
        assert_eq!(buf, vec![1, 2, 3]);
    }
}
