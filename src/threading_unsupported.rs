compile_error!(
    "the ult runtime requires the Linux ucontext and per-thread timer facilities; \
     no port exists for this target"
);
