//! Loading chunks from host byte streams.

use std::{
    ffi::{c_char, c_void},
    fs::File,
    io::{self, Read},
    panic::{AssertUnwindSafe, catch_unwind},
    path::Path,
    ptr,
};

use crate::{
    context::CancelContext,
    error::{Error, ErrorKind, Result},
    ffi,
    function::panic_message,
    state::{State, c_name},
};

const CHUNK_SIZE: usize = 64 * 1024;

/// Name used for chunks loaded from strings.
pub const STRING_CHUNK: &str = "<string>";

struct ChunkReader<'a> {
    source: &'a mut dyn Read,
    buf: Vec<u8>,
    failure: Option<Error>,
}

impl ChunkReader<'_> {
    fn fill(&mut self) -> io::Result<usize> {
        loop {
            match self.source.read(&mut self.buf) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }
}

unsafe extern "C-unwind" fn read_chunk(
    _raw: *mut ffi::lua_State,
    data: *mut c_void,
    size: *mut usize,
) -> *const c_char {
    let reader = unsafe { &mut *data.cast::<ChunkReader<'_>>() };
    unsafe { *size = 0 };
    if reader.failure.is_some() {
        return ptr::null();
    }

    match catch_unwind(AssertUnwindSafe(|| reader.fill())) {
        Ok(Ok(0)) => ptr::null(),
        Ok(Ok(n)) => {
            unsafe { *size = n };
            reader.buf.as_ptr().cast()
        }
        Ok(Err(err)) => {
            reader.failure = Some(err.into());
            ptr::null()
        }
        Err(payload) => {
            reader.failure = Some(Error::new(
                ErrorKind::File,
                format!("chunk reader panicked: {}", panic_message(payload.as_ref())),
            ));
            ptr::null()
        }
    }
}

impl State {
    /// Compile a chunk streamed from `reader` and push it as a function.
    ///
    /// `name` becomes `@name` for files and `=name` otherwise, so messages
    /// show it verbatim. Read failures are reported as [`ErrorKind::File`].
    pub fn load(&mut self, mut reader: impl Read, name: &str, is_file: bool) -> Result<()> {
        let chunk_name = c_name(&format!("{}{name}", if is_file { "@" } else { "=" }));
        let mut chunk = ChunkReader {
            source: &mut reader,
            buf: vec![0; CHUNK_SIZE],
            failure: None,
        };

        let status = unsafe {
            ffi::lua_load(
                self.raw(),
                read_chunk,
                (&mut chunk as *mut ChunkReader<'_>).cast(),
                chunk_name.as_ptr(),
                ptr::null(),
            )
        };

        if let Some(failure) = chunk.failure.take() {
            // Either the truncated chunk or its error message.
            self.pop(1);
            return Err(failure);
        }
        self.check_status(status)
    }

    /// Compile `code` as a chunk named `name`.
    pub fn load_buffer(&mut self, code: impl AsRef<[u8]>, name: &str) -> Result<()> {
        self.load(code.as_ref(), name, false)
    }

    /// Compile `code` as a chunk named `<string>`.
    pub fn load_string(&mut self, code: impl AsRef<[u8]>) -> Result<()> {
        self.load_buffer(code, STRING_CHUNK)
    }

    /// Compile the file at `path`.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|err| Error::new(ErrorKind::File, format!("cannot open {}: {err}", path.display())))?;
        self.load(io::BufReader::new(file), &path.display().to_string(), true)
    }

    /// Load and run a chunk, discarding its results.
    pub fn do_reader(&mut self, reader: impl Read, name: &str, is_file: bool) -> Result<()> {
        self.load(reader, name, is_file)?;
        self.call(0, 0)
    }

    /// Load and run `code`, discarding its results.
    pub fn do_string(&mut self, code: impl AsRef<[u8]>) -> Result<()> {
        self.load_string(code)?;
        self.call(0, 0)
    }

    /// Load and run the file at `path`, discarding its results.
    pub fn do_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.load_file(path)?;
        self.call(0, 0)
    }

    /// [`State::do_reader`] under a cancellation context.
    pub fn do_with_context(
        &mut self,
        ctx: &CancelContext,
        reader: impl Read,
        name: &str,
        is_file: bool,
    ) -> Result<()> {
        self.load(reader, name, is_file)?;
        self.call_with_context(ctx, 0, 0)
    }

    /// [`State::do_string`] under a cancellation context.
    pub fn do_string_with_context(&mut self, ctx: &CancelContext, code: impl AsRef<[u8]>) -> Result<()> {
        self.load_string(code)?;
        self.call_with_context(ctx, 0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Type;

    struct Failing {
        served: bool,
    }

    impl Read for Failing {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.served {
                return Err(io::Error::other("disk on fire"));
            }
            self.served = true;
            let head = b"return ";
            buf[..head.len()].copy_from_slice(head);
            Ok(head.len())
        }
    }

    #[test]
    fn one_plus_one() {
        let mut state = State::new().unwrap();
        state.load_string("return 1+1").unwrap();
        state.call(0, 1).unwrap();
        assert!(state.is_integer(-1));
        assert_eq!(state.to_integer(-1), 2);
        assert_eq!(state.get_top(), 1);
    }

    #[test]
    fn streams_large_chunks() {
        let mut code = String::from("local t = {}\n");
        for i in 0..20_000 {
            code.push_str(&format!("t[#t + 1] = {i}\n"));
        }
        code.push_str("return #t");

        let mut state = State::new().unwrap();
        state.load(code.as_bytes(), "big", false).unwrap();
        state.call(0, 1).unwrap();
        assert_eq!(state.to_integer(-1), 20_000);
    }

    #[test]
    fn syntax_errors_keep_chunk_name() {
        let mut state = State::new().unwrap();
        let err = state.load_buffer("local = 1", "broken").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Syntax);
        assert!(err.message().starts_with("broken:1:"), "{}", err.message());
        assert_eq!(state.get_top(), 0);
    }

    #[test]
    fn reader_failures_are_file_errors() {
        let mut state = State::new().unwrap();
        let err = state.load(Failing { served: false }, "flaky", false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::File);
        assert_eq!(err.message(), "disk on fire");
        assert_eq!(state.get_top(), 0);
    }

    #[test]
    fn missing_file() {
        let mut state = State::new().unwrap();
        let err = state.do_file("/nonexistent/script.lua").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::File);
    }

    #[test]
    fn files_use_their_path_as_chunk_name() {
        let dir = std::env::temp_dir().join(format!("gilua-load-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("answer.lua");
        std::fs::write(&path, "answer = 42\nerror('nope')").unwrap();

        let mut state = State::new().unwrap();
        let err = state.do_file(&path).unwrap_err();
        let trace = err.trace().expect("traced");
        assert_eq!(trace.line, 2);
        assert!(trace.chunk_name.ends_with("answer.lua"), "{}", trace.chunk_name);

        state.get_global("answer").unwrap();
        assert_eq!(state.type_of(-1), Type::Number);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
