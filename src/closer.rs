//! Pipelines are stacks of layers, each owning the one beneath it.
//! Closing a pipeline closes every layer exactly once,
//! from the caller-facing end down to the file
//! (the reverse of the order they were built in),
//! and reports every failure along the way.

use std::io::{self, Read, Seek, Write};

use log::*;

use crate::result::*;

/// A stage of a read pipeline
pub(crate) trait ReadLayer: Read {
    /// A short name for logs
    fn describe(&self) -> &'static str;

    /// Releases whatever this layer holds, but not the layers under it.
    fn close_layer(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// The layer this one reads from, if any
    fn inner_layer(&mut self) -> Option<&mut dyn ReadLayer>;

    /// Seeks the layer's own stream, if it can.
    /// Only the file at the bottom of a pipeline can.
    fn as_seek(&mut self) -> Option<&mut dyn Seek> {
        None
    }
}

/// A stage of a write pipeline
pub(crate) trait WriteLayer: Write {
    /// A short name for logs
    fn describe(&self) -> &'static str;

    /// Finishes this layer (trailers, padding, footers...)
    /// and releases whatever it holds, but not the layers under it.
    fn close_layer(&mut self) -> io::Result<()> {
        self.flush()
    }

    /// The layer this one writes to, if any
    fn inner_layer(&mut self) -> Option<&mut dyn WriteLayer>;
}

/// Closes `top` and everything beneath it, collecting errors.
pub(crate) fn close_read_layers(top: &mut dyn ReadLayer, errors: &mut Vec<FileError>) {
    let mut current = Some(top);
    while let Some(layer) = current {
        trace!("Closing {} layer", layer.describe());
        if let Err(e) = layer.close_layer() {
            errors.push(FileError::from(e).context(format!("closing {}", layer.describe())));
        }
        current = layer.inner_layer();
    }
}

/// Closes `top` and everything beneath it, collecting errors.
///
/// Writers keep going after a failure so that the file
/// underneath is always released.
pub(crate) fn close_write_layers(top: &mut dyn WriteLayer, errors: &mut Vec<FileError>) {
    let mut current = Some(top);
    while let Some(layer) = current {
        trace!("Closing {} layer", layer.describe());
        if let Err(e) = layer.close_layer() {
            errors.push(FileError::from(e).context(format!("closing {}", layer.describe())));
        }
        current = layer.inner_layer();
    }
}

/// Tracks whether a pipeline has been closed
/// and turns a close into a single result.
#[derive(Debug, Default)]
pub(crate) struct Closer {
    closed: bool,
}

impl Closer {
    pub fn closed(&self) -> bool {
        self.closed
    }

    /// Runs `close_all` the first time it's called; later calls do nothing.
    ///
    /// `close_all` receives a list to push errors onto;
    /// they're combined in the order they were pushed.
    pub fn close<F: FnOnce(&mut Vec<FileError>)>(&mut self, close_all: F) -> FileResult<()> {
        if self.closed {
            return Ok(());
        }
        let mut errors = Vec::new();
        close_all(&mut errors);
        self.closed = true;
        match FileError::combine(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<&'static str>>>;

    struct Recorder {
        name: &'static str,
        log: Log,
        fail: bool,
        inner: Option<Box<Recorder>>,
    }

    impl Recorder {
        fn stack(names: &[&'static str], fail: &[&'static str], log: &Log) -> Box<Recorder> {
            let mut top: Option<Box<Recorder>> = None;
            // Built bottom-up, like the pipeline builder does.
            for name in names {
                top = Some(Box::new(Recorder {
                    name: *name,
                    log: log.clone(),
                    fail: fail.contains(name),
                    inner: top,
                }));
            }
            top.unwrap()
        }

        fn finish(&mut self) -> io::Result<()> {
            self.log.borrow_mut().push(self.name);
            if self.fail {
                Err(io::Error::new(io::ErrorKind::Other, self.name))
            } else {
                Ok(())
            }
        }
    }

    impl Read for Recorder {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    impl Write for Recorder {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl ReadLayer for Recorder {
        fn describe(&self) -> &'static str {
            self.name
        }

        fn close_layer(&mut self) -> io::Result<()> {
            self.finish()
        }

        fn inner_layer(&mut self) -> Option<&mut dyn ReadLayer> {
            self.inner.as_deref_mut().map(|r| r as &mut dyn ReadLayer)
        }
    }

    impl WriteLayer for Recorder {
        fn describe(&self) -> &'static str {
            self.name
        }

        fn close_layer(&mut self) -> io::Result<()> {
            self.finish()
        }

        fn inner_layer(&mut self) -> Option<&mut dyn WriteLayer> {
            self.inner.as_deref_mut().map(|r| r as &mut dyn WriteLayer)
        }
    }

    #[test]
    fn closes_in_reverse_build_order_once() {
        let log = Log::default();
        let mut top = Recorder::stack(&["file", "gzip", "tar"], &[], &log);
        let mut closer = Closer::default();
        assert!(!closer.closed());

        closer
            .close(|errors| close_read_layers(&mut *top, errors))
            .unwrap();
        assert!(closer.closed());
        closer
            .close(|errors| close_read_layers(&mut *top, errors))
            .unwrap();

        assert_eq!(*log.borrow(), ["tar", "gzip", "file"]);
    }

    #[test]
    fn keeps_closing_after_failures() {
        let log = Log::default();
        let mut top = Recorder::stack(&["file", "gzip", "zip"], &["zip", "gzip"], &log);
        let mut closer = Closer::default();

        let err = closer
            .close(|errors| close_write_layers(&mut *top, errors))
            .unwrap_err();
        assert_eq!(*log.borrow(), ["zip", "gzip", "file"]);
        match err {
            FileError::Multiple(errors) => {
                assert_eq!(errors.len(), 2);
                assert!(errors[0].to_string().starts_with("closing zip"));
                assert!(errors[1].to_string().starts_with("closing gzip"));
            }
            other => panic!("Expected two errors, got {:?}", other),
        }
        assert!(closer.closed());
        assert!(closer.close(|_| unreachable!()).is_ok());
    }
}
