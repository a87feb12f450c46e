//! Emits a standalone ISO C99 program for the whole IR.

use super::CodeGen;
use crate::inst::Inst;
use crate::jit::{self, IoMode};

pub struct CGen {
    output: String,
    indent: &'static str,
    level: usize,
    heap_size: usize,
    breakpoints: bool,
}

impl CGen {
    pub fn new(heap_size: usize, breakpoints: bool) -> CGen {
        CGen {
            output: String::new(),
            indent: "  ",
            level: 1,
            heap_size,
            breakpoints,
        }
    }

    pub fn finish(self) -> String {
        self.output
    }

    fn put(&mut self, line: &str) {
        for _ in 0..self.level {
            self.output.push_str(self.indent);
        }
        self.output.push_str(line);
        self.output.push('\n');
    }

    fn raw(&mut self, text: &str) {
        self.output.push_str(text);
    }
}

impl CodeGen for CGen {
    fn emit_header(&mut self) {
        self.raw("#include <stdio.h>\n#include <stdlib.h>\n#include <string.h>\n\n");
        if self.breakpoints {
            self.raw(concat!(
                "#if defined(_MSC_VER)\n",
                "#  define debugbreak()  __debugbreak()\n",
                "#elif defined(__i386__) || defined(__x86_64__)\n",
                "#  define debugbreak()  __asm__ volatile (\"int $3\")\n",
                "#elif defined(__arm__)\n",
                "#  define debugbreak()  __asm__ volatile (\".inst 0xe7f001f0\")\n",
                "#else\n",
                "#  include <signal.h>\n",
                "#  define debugbreak()  raise(SIGTRAP)\n",
                "#endif\n\n",
            ));
        }
        self.raw(&format!("#define MEMORY_SIZE {}\n\n", self.heap_size));
        self.raw(concat!(
            "int\n",
            "main(void)\n",
            "{\n",
            "  unsigned char memory[MEMORY_SIZE] = {0};\n",
            "  unsigned char *p = memory + MEMORY_SIZE / 2;\n\n",
        ));
    }

    fn emit_footer(&mut self) {
        self.raw("\n  putchar('\\n');\n\n  return EXIT_SUCCESS;\n}\n");
    }

    fn emit_move_pointer(&mut self, offset: i32) {
        match offset {
            1 => self.put("p++;"),
            -1 => self.put("p--;"),
            n if n > 0 => self.put(&format!("p += {};", n)),
            n => self.put(&format!("p -= {};", -n)),
        }
    }

    fn emit_add(&mut self, value: i32) {
        match value {
            1 => self.put("(*p)++;"),
            -1 => self.put("(*p)--;"),
            n if n > 0 => self.put(&format!("*p += {};", n)),
            n => self.put(&format!("*p -= {};", -n)),
        }
    }

    fn emit_putchar(&mut self) {
        self.put("putchar(*p);");
    }

    fn emit_getchar(&mut self) {
        // EOF must leave the cell untouched
        self.put("{ int c = getchar(); if (c != EOF) *p = (unsigned char) c; }");
    }

    fn emit_loop_start(&mut self) {
        self.put("while (*p) {");
        self.level += 1;
    }

    fn emit_loop_end(&mut self) {
        self.level -= 1;
        self.put("}");
    }

    fn emit_if(&mut self) {
        self.put("if (*p) {");
        self.level += 1;
    }

    fn emit_end_if(&mut self) {
        self.emit_loop_end();
    }

    fn emit_assign(&mut self, value: i32) {
        self.put(&format!("*p = {};", value));
    }

    fn emit_search_zero(&mut self, step: i32) {
        match step {
            1 => self.put("p = memchr(p, 0, (size_t) (memory + MEMORY_SIZE - p));"),
            -1 => self.put("for (; *p; p--);"),
            n if n > 0 => self.put(&format!("for (; *p; p += {});", n)),
            n => self.put(&format!("for (; *p; p -= {});", -n)),
        }
    }

    fn emit_add_var(&mut self, offset: i32) {
        if offset > 0 {
            self.put(&format!("*(p + {}) += *p;", offset));
        } else {
            self.put(&format!("*(p - {}) += *p;", -offset));
        }
    }

    fn emit_sub_var(&mut self, offset: i32) {
        if offset > 0 {
            self.put(&format!("*(p + {}) -= *p;", offset));
        } else {
            self.put(&format!("*(p - {}) -= *p;", -offset));
        }
    }

    fn emit_add_cmul_var(&mut self, offset: i32, mul: i32) {
        if offset > 0 {
            self.put(&format!("*(p + {}) += *p * {};", offset, mul));
        } else {
            self.put(&format!("*(p - {}) += *p * {};", -offset, mul));
        }
    }

    fn emit_inf_loop(&mut self) {
        self.put("if (*p) {");
        self.level += 1;
        self.put("for (;;);");
        self.level -= 1;
        self.put("}");
    }

    fn emit_break_point(&mut self) {
        self.put("debugbreak();");
    }
}

/// Compiles IR to a self-contained C program.
pub fn c_source(ir: &[Inst], heap_size: usize) -> String {
    let breakpoints = ir.iter().any(|inst| matches!(inst, Inst::BreakPoint));
    let mut gen = CGen::new(heap_size, breakpoints);
    super::emit(&mut gen, ir);
    gen.finish()
}

/// Dumps the JIT assembler's x86-64 output as a C program that maps the
/// bytes executable and calls them (the syscall I/O flavor, so the code is
/// self-contained).
pub fn jit_dump_source(ir: &[Inst], heap_size: usize) -> String {
    let code = jit::compile(ir, IoMode::Syscall);

    let mut hex = String::new();
    for (i, byte) in code.iter().enumerate() {
        if i % 12 == 0 {
            if i != 0 {
                hex.push('\n');
            }
            hex.push_str("  ");
        } else {
            hex.push(' ');
        }
        hex.push_str(&format!("0x{:02x},", byte));
    }

    format!(
        concat!(
            "/* x86-64 machine code produced by the JIT assembler. */\n",
            "#include <stdio.h>\n",
            "#include <stdlib.h>\n",
            "#include <string.h>\n",
            "#include <sys/mman.h>\n\n",
            "#define MEMORY_SIZE {}\n\n",
            "static const unsigned char code[] = {{\n",
            "{}\n",
            "}};\n\n",
            "int\n",
            "main(void)\n",
            "{{\n",
            "  void (*entry)(unsigned char *);\n",
            "  unsigned char *memory = calloc(MEMORY_SIZE, 1);\n",
            "  void *text = mmap(NULL, sizeof(code), PROT_READ | PROT_WRITE,\n",
            "                    MAP_PRIVATE | MAP_ANONYMOUS, -1, 0);\n",
            "  if (memory == NULL || text == MAP_FAILED) {{\n",
            "    return EXIT_FAILURE;\n",
            "  }}\n",
            "  memcpy(text, code, sizeof(code));\n",
            "  if (mprotect(text, sizeof(code), PROT_READ | PROT_EXEC) != 0) {{\n",
            "    return EXIT_FAILURE;\n",
            "  }}\n",
            "  entry = (void (*)(unsigned char *)) text;\n",
            "  entry(memory + MEMORY_SIZE / 2);\n",
            "  putchar('\\n');\n",
            "  return EXIT_SUCCESS;\n",
            "}}\n",
        ),
        heap_size, hex
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    #[test]
    fn emits_the_obvious_translations() {
        let ir = parse(b"++>.,<-").unwrap();
        let out = c_source(&ir, 65536);
        assert!(out.contains("*p += 2;"));
        assert!(out.contains("p++;"));
        assert!(out.contains("putchar(*p);"));
        assert!(out.contains("if (c != EOF)"));
        assert!(out.contains("p--;"));
        assert!(out.contains("(*p)--;"));
        assert!(out.contains("return EXIT_SUCCESS;"));
    }

    #[test]
    fn loops_nest_with_indentation() {
        let ir = parse(b"+[.[-]]").unwrap();
        let out = c_source(&ir, 65536);
        assert!(out.contains("  while (*p) {"));
        assert!(out.contains("    putchar(*p);"));
        assert!(out.contains("    *p = 0;"));
    }

    #[test]
    fn forward_scan_uses_memchr() {
        let ir = parse(b"[>]").unwrap();
        let out = c_source(&ir, 65536);
        assert!(out.contains("p = memchr(p, 0, (size_t) (memory + MEMORY_SIZE - p));"));
    }

    #[test]
    fn copy_loop_emits_guarded_var_ops() {
        let ir = parse(b"[->++<]").unwrap();
        let out = c_source(&ir, 65536);
        assert!(out.contains("if (*p) {"));
        assert!(out.contains("*(p + 1) += *p * 2;"));
        assert!(out.contains("*p = 0;"));
    }

    #[test]
    fn heap_size_lands_in_the_define() {
        let ir = parse(b"+").unwrap();
        let out = c_source(&ir, 30000);
        assert!(out.contains("#define MEMORY_SIZE 30000"));
    }

    #[test]
    fn debugbreak_macro_only_appears_when_used() {
        let with = c_source(&parse(b"#").unwrap(), 65536);
        assert!(with.contains("#  define debugbreak()"));
        assert!(with.contains("debugbreak();"));
        let without = c_source(&parse(b"+").unwrap(), 65536);
        assert!(!without.contains("debugbreak"));
    }

    #[test]
    fn jit_dump_wraps_the_code_bytes() {
        let out = jit_dump_source(&parse(b"+").unwrap(), 65536);
        // prologue: push rbx; mov rbx, rdi
        assert!(out.contains("0x53, 0x48, 0x89, 0xfb,"));
        assert!(out.contains("mprotect"));
        assert!(out.contains("entry(memory + MEMORY_SIZE / 2);"));
    }
}
