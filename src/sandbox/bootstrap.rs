/// `bootstrap.py` generation for the Python guest runtime
use crate::core::types::SandboxMeta;
use std::fmt::Write;

/// Path of the control socket as seen from inside the guest.
pub const GUEST_SOCK: &str = "/host/ol.sock";

/// Build the script the Python server runs at startup.
///
/// Leaves serve requests with `web_server`. Zygotes import the modules their
/// parent lacks and then wait for fork requests with `fork_server`.
/// `parent_imports` is empty for sandboxes started as fresh processes.
pub fn bootstrap_code(meta: &SandboxMeta, parent_imports: &[String], is_leaf: bool) -> String {
    let mut code = String::from("import os, sys\n");
    if is_leaf {
        code.push_str("sys.path.extend(['/packages', '/handler'])\n");
    } else {
        code.push_str("sys.path.extend(['/packages'])\n");
    }
    code.push('\n');

    for pkg in &meta.installs {
        let dir = format!("/packages/{}/files", pkg);
        let _ = writeln!(code, "if os.path.exists('{}'):", dir);
        let _ = writeln!(code, "    if not '{}' in sys.path:", dir);
        let _ = writeln!(code, "        sys.path.insert(0, '{}')", dir);
    }

    for module in meta.import_delta(parent_imports) {
        code.push_str("try:\n");
        let _ = writeln!(code, "    import {}", module);
        code.push_str("except Exception as e:\n");
        code.push_str("    print('bootstrap.py error:', e)\n");
    }

    code.push('\n');
    let server = if is_leaf { "web_server" } else { "fork_server" };
    let _ = writeln!(code, "{}('{}')", server, GUEST_SOCK);
    code
}
